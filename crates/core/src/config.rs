//! Configuration types for the segmentation pipeline
//!
//! Every field has a serde default so partial TOML/JSON/YAML documents load
//! cleanly. Call [`SegmentationConfig::validate`] (the file loaders do this
//! for you) before handing a config to the scheduler.
//!
//! # Example
//!
//! ```
//! use wallseg_core::config::SegmentationConfig;
//!
//! let config = SegmentationConfig::from_toml_str(
//!     r#"
//!     max_invocations_per_second = 10.0
//!
//!     [quality]
//!     target_latency_budget_ms = 40.0
//!
//!     [reconstruction]
//!     enable_temporal_blend = true
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.quality.target_latency_budget_ms, 40.0);
//! assert!(config.reconstruction.enable_temporal_blend);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::data::Resolution;
use crate::tensor::TensorShape;
use crate::{Error, Result};

/// Frame interval assumed for exponential blending when the rate is unlimited
const UNLIMITED_RATE_REFERENCE_FPS: f64 = 30.0;

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationConfig {
    /// Maximum pipeline runs started per second (0 = unlimited)
    #[serde(default = "default_max_invocations_per_second")]
    pub max_invocations_per_second: f32,

    /// Resolution of the published display mask, fixed for the process lifetime
    #[serde(default = "default_display_resolution")]
    pub display_resolution: Resolution,

    /// Age after which the last published mask is considered stale
    #[serde(default = "default_max_mask_age_ms")]
    pub max_mask_age_ms: u64,

    /// Consecutive empty acquisitions before switching to synthetic frames
    #[serde(default = "default_simulation_fallback_threshold")]
    pub simulation_fallback_threshold: u32,

    /// Mask updates retained for slow subscribers (rounded up to a power of
    /// two); older ones are skipped
    #[serde(default = "default_mask_queue_depth")]
    pub mask_queue_depth: usize,

    /// Closed-loop resolution control
    #[serde(default)]
    pub quality: QualityConfig,

    /// Mask reconstruction stages
    #[serde(default)]
    pub reconstruction: ReconstructionConfig,

    /// Inference output handling
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Buffer pool limits and watchdog
    #[serde(default)]
    pub pool: PoolConfig,

    /// Performance logging
    #[serde(default)]
    pub monitor: MonitorConfig,
}

fn default_max_invocations_per_second() -> f32 {
    15.0
}
fn default_display_resolution() -> Resolution {
    Resolution::new(640, 480)
}
fn default_max_mask_age_ms() -> u64 {
    3_000
}
fn default_simulation_fallback_threshold() -> u32 {
    10
}
fn default_mask_queue_depth() -> usize {
    4
}

/// Largest accepted `mask_queue_depth`
pub const MAX_MASK_QUEUE_DEPTH: usize = 64;

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            max_invocations_per_second: default_max_invocations_per_second(),
            display_resolution: default_display_resolution(),
            max_mask_age_ms: default_max_mask_age_ms(),
            simulation_fallback_threshold: default_simulation_fallback_threshold(),
            mask_queue_depth: default_mask_queue_depth(),
            quality: QualityConfig::default(),
            reconstruction: ReconstructionConfig::default(),
            inference: InferenceConfig::default(),
            pool: PoolConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

/// Closed-loop resolution controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Per-run latency budget in milliseconds
    #[serde(default = "default_target_latency_budget_ms")]
    pub target_latency_budget_ms: f32,

    /// Working resolution at startup
    #[serde(default = "default_input_resolution")]
    pub input_resolution: Resolution,

    /// Lowest working resolution
    #[serde(default = "default_min_resolution")]
    pub min_resolution: Resolution,

    /// Highest working resolution
    #[serde(default = "default_max_resolution")]
    pub max_resolution: Resolution,

    /// Step applied on every adjustment
    #[serde(default = "default_resolution_step")]
    pub resolution_step: Resolution,

    /// Rolling latency window length (K)
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,

    /// Consecutive over-budget samples before stepping down
    #[serde(default = "default_samples_to_step_down")]
    pub samples_to_step_down: u32,

    /// Consecutive well-under-budget samples before stepping up
    #[serde(default = "default_samples_to_step_up")]
    pub samples_to_step_up: u32,

    /// Minimum time between two resolution changes
    #[serde(default = "default_adjustment_cooldown_ms")]
    pub adjustment_cooldown_ms: u64,

    /// Whether the controller adapts at all
    #[serde(default = "default_true")]
    pub adaptive: bool,
}

fn default_target_latency_budget_ms() -> f32 {
    50.0
}
fn default_input_resolution() -> Resolution {
    Resolution::new(640, 480)
}
fn default_min_resolution() -> Resolution {
    Resolution::new(384, 384)
}
fn default_max_resolution() -> Resolution {
    Resolution::new(768, 768)
}
fn default_resolution_step() -> Resolution {
    Resolution::new(64, 48)
}
fn default_latency_window() -> usize {
    10
}
fn default_samples_to_step_down() -> u32 {
    3
}
fn default_samples_to_step_up() -> u32 {
    5
}
fn default_adjustment_cooldown_ms() -> u64 {
    2_000
}
fn default_true() -> bool {
    true
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            target_latency_budget_ms: default_target_latency_budget_ms(),
            input_resolution: default_input_resolution(),
            min_resolution: default_min_resolution(),
            max_resolution: default_max_resolution(),
            resolution_step: default_resolution_step(),
            latency_window: default_latency_window(),
            samples_to_step_down: default_samples_to_step_down(),
            samples_to_step_up: default_samples_to_step_up(),
            adjustment_cooldown_ms: default_adjustment_cooldown_ms(),
            adaptive: true,
        }
    }
}

impl QualityConfig {
    /// Minimum time between two resolution changes
    pub fn adjustment_cooldown(&self) -> Duration {
        Duration::from_millis(self.adjustment_cooldown_ms)
    }
}

/// How the current display mask is combined with the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendMode {
    /// Fixed-weight lerp towards the current mask
    Linear,
    /// Weight scaled by elapsed time so smoothing is frame-rate independent
    #[default]
    Exponential,
}

/// Mask reconstruction settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    /// Run the blur + threshold stage on the low-resolution mask
    #[serde(default = "default_true")]
    pub enable_denoise: bool,

    /// Blur kernel radius (1 = 3x3)
    #[serde(default = "default_denoise_radius")]
    pub denoise_radius: u32,

    /// Re-binarization threshold applied after the blur
    #[serde(default = "default_denoise_threshold")]
    pub denoise_threshold: f32,

    /// Blend the display mask with the previous run's mask
    #[serde(default)]
    pub enable_temporal_blend: bool,

    /// Weight of the current mask, in (0, 1]
    #[serde(default = "default_temporal_blend_factor")]
    pub temporal_blend_factor: f32,

    /// Blend curve
    #[serde(default)]
    pub temporal_blend_mode: BlendMode,
}

/// Largest accepted denoise kernel radius
pub const MAX_DENOISE_RADIUS: u32 = 8;

fn default_denoise_radius() -> u32 {
    1
}
fn default_denoise_threshold() -> f32 {
    0.5
}
fn default_temporal_blend_factor() -> f32 {
    0.6
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            enable_denoise: true,
            denoise_radius: default_denoise_radius(),
            denoise_threshold: default_denoise_threshold(),
            enable_temporal_blend: false,
            temporal_blend_factor: default_temporal_blend_factor(),
            temporal_blend_mode: BlendMode::default(),
        }
    }
}

/// Inference output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Result tensor channel rendered into the mask
    #[serde(default)]
    pub mask_channel: usize,

    /// Output shape assumed when the engine cannot report one
    #[serde(default = "default_fallback_output_shape")]
    pub fallback_output_shape: TensorShape,
}

fn default_fallback_output_shape() -> TensorShape {
    TensorShape::new(1, 1, 120, 160)
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            mask_channel: 0,
            fallback_output_shape: default_fallback_output_shape(),
        }
    }
}

/// Buffer pool limits and memory watchdog settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Cap on pooled bytes before a forced cleanup
    #[serde(default = "default_max_pool_size_bytes")]
    pub max_pool_size_bytes: usize,

    /// Watchdog check period
    #[serde(default = "default_memory_check_interval_ms")]
    pub memory_check_interval_ms: u64,

    /// Live buffer count above which a leak is reported
    #[serde(default = "default_leak_outstanding_threshold")]
    pub leak_outstanding_threshold: u64,

    /// Checks over which a strictly rising live count is reported as a leak
    #[serde(default = "default_leak_trend_window")]
    pub leak_trend_window: usize,

    /// Force a cleanup when a leak is suspected
    #[serde(default = "default_true")]
    pub enable_automatic_cleanup: bool,
}

fn default_max_pool_size_bytes() -> usize {
    200 * 1024 * 1024
}
fn default_memory_check_interval_ms() -> u64 {
    15_000
}
fn default_leak_outstanding_threshold() -> u64 {
    20
}
fn default_leak_trend_window() -> usize {
    5
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size_bytes: default_max_pool_size_bytes(),
            memory_check_interval_ms: default_memory_check_interval_ms(),
            leak_outstanding_threshold: default_leak_outstanding_threshold(),
            leak_trend_window: default_leak_trend_window(),
            enable_automatic_cleanup: true,
        }
    }
}

impl PoolConfig {
    /// Watchdog check period
    pub fn memory_check_interval(&self) -> Duration {
        Duration::from_millis(self.memory_check_interval_ms)
    }
}

/// Performance logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Period between aggregated stats log lines
    #[serde(default = "default_performance_log_interval_ms")]
    pub performance_log_interval_ms: u64,

    /// Emit the periodic stats line at all
    #[serde(default = "default_true")]
    pub enable_periodic_log: bool,
}

fn default_performance_log_interval_ms() -> u64 {
    5_000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            performance_log_interval_ms: default_performance_log_interval_ms(),
            enable_periodic_log: true,
        }
    }
}

impl MonitorConfig {
    /// Period between aggregated stats log lines
    pub fn performance_log_interval(&self) -> Duration {
        Duration::from_millis(self.performance_log_interval_ms)
    }
}

impl SegmentationConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, choosing the parser from its extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&contents),
            Some("json") => Self::from_json_str(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents),
            other => Err(Error::InvalidConfig(format!(
                "unsupported config extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }

    /// Set the maximum run rate (0 = unlimited)
    pub fn with_max_invocations_per_second(mut self, rate: f32) -> Self {
        self.max_invocations_per_second = rate;
        self
    }

    /// Set the display mask resolution
    pub fn with_display_resolution(mut self, resolution: Resolution) -> Self {
        self.display_resolution = resolution;
        self
    }

    /// Set the per-run latency budget
    pub fn with_target_latency_budget_ms(mut self, budget_ms: f32) -> Self {
        self.quality.target_latency_budget_ms = budget_ms;
        self
    }

    /// Set the working resolution range and step
    pub fn with_resolution_bounds(
        mut self,
        min: Resolution,
        max: Resolution,
        step: Resolution,
    ) -> Self {
        self.quality.min_resolution = min;
        self.quality.max_resolution = max;
        self.quality.resolution_step = step;
        self
    }

    /// Set the startup working resolution
    pub fn with_input_resolution(mut self, resolution: Resolution) -> Self {
        self.quality.input_resolution = resolution;
        self
    }

    /// Set the controller's cooldown between resolution changes
    pub fn with_adjustment_cooldown(mut self, cooldown: Duration) -> Self {
        self.quality.adjustment_cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    /// Enable or disable the denoise stage
    pub fn with_denoise(mut self, enabled: bool) -> Self {
        self.reconstruction.enable_denoise = enabled;
        self
    }

    /// Enable temporal blending with the given factor and curve
    pub fn with_temporal_blend(mut self, factor: f32, mode: BlendMode) -> Self {
        self.reconstruction.enable_temporal_blend = true;
        self.reconstruction.temporal_blend_factor = factor;
        self.reconstruction.temporal_blend_mode = mode;
        self
    }

    /// Set the output shape used when discovery fails
    pub fn with_fallback_output_shape(mut self, shape: TensorShape) -> Self {
        self.inference.fallback_output_shape = shape;
        self
    }

    /// Set how many mask updates a lagging subscriber can fall behind
    pub fn with_mask_queue_depth(mut self, depth: usize) -> Self {
        self.mask_queue_depth = depth;
        self
    }

    /// Set the pool byte cap
    pub fn with_max_pool_size_bytes(mut self, bytes: usize) -> Self {
        self.pool.max_pool_size_bytes = bytes;
        self
    }

    /// Minimum interval between accepted run starts, `None` when unlimited
    pub fn min_run_interval(&self) -> Option<Duration> {
        if self.max_invocations_per_second > 0.0 {
            Duration::try_from_secs_f64(1.0 / self.max_invocations_per_second as f64).ok()
        } else {
            None
        }
    }

    /// Nominal frame interval used to normalize exponential blending
    pub fn blend_reference_interval(&self) -> Duration {
        self.min_run_interval()
            .unwrap_or_else(|| Duration::from_secs_f64(1.0 / UNLIMITED_RATE_REFERENCE_FPS))
    }

    /// Age after which the last published mask is stale
    pub fn max_mask_age(&self) -> Duration {
        Duration::from_millis(self.max_mask_age_ms)
    }

    /// Check every field for a usable value
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if !self.max_invocations_per_second.is_finite() || self.max_invocations_per_second < 0.0 {
            return invalid(format!(
                "max_invocations_per_second must be >= 0, got {}",
                self.max_invocations_per_second
            ));
        }
        if self.max_invocations_per_second > 0.0 && self.min_run_interval().is_none() {
            return invalid(format!(
                "max_invocations_per_second {} is too small to express as a run interval",
                self.max_invocations_per_second
            ));
        }
        if self.display_resolution.is_empty() {
            return invalid("display_resolution must be non-zero".into());
        }
        if self.mask_queue_depth == 0 || self.mask_queue_depth > MAX_MASK_QUEUE_DEPTH {
            return invalid(format!(
                "mask_queue_depth must be in [1, {}], got {}",
                MAX_MASK_QUEUE_DEPTH, self.mask_queue_depth
            ));
        }

        let q = &self.quality;
        if !q.target_latency_budget_ms.is_finite() || q.target_latency_budget_ms <= 0.0 {
            return invalid(format!(
                "target_latency_budget_ms must be > 0, got {}",
                q.target_latency_budget_ms
            ));
        }
        if q.min_resolution.is_empty() {
            return invalid("min_resolution must be non-zero".into());
        }
        if q.min_resolution.width > q.max_resolution.width
            || q.min_resolution.height > q.max_resolution.height
        {
            return invalid(format!(
                "min_resolution {} exceeds max_resolution {}",
                q.min_resolution, q.max_resolution
            ));
        }
        if q.resolution_step.is_empty() {
            return invalid("resolution_step must be non-zero in both dimensions".into());
        }
        if !q.input_resolution.within(q.min_resolution, q.max_resolution) {
            return invalid(format!(
                "input_resolution {} outside [{}, {}]",
                q.input_resolution, q.min_resolution, q.max_resolution
            ));
        }
        if q.latency_window == 0 || q.samples_to_step_down == 0 || q.samples_to_step_up == 0 {
            return invalid("latency window and sample counts must be >= 1".into());
        }

        let r = &self.reconstruction;
        if !(r.temporal_blend_factor > 0.0 && r.temporal_blend_factor <= 1.0) {
            return invalid(format!(
                "temporal_blend_factor must be in (0, 1], got {}",
                r.temporal_blend_factor
            ));
        }
        if r.denoise_radius > MAX_DENOISE_RADIUS {
            return invalid(format!(
                "denoise_radius must be <= {}, got {}",
                MAX_DENOISE_RADIUS, r.denoise_radius
            ));
        }
        if !(0.0..=1.0).contains(&r.denoise_threshold) {
            return invalid(format!(
                "denoise_threshold must be in [0, 1], got {}",
                r.denoise_threshold
            ));
        }

        if self.inference.fallback_output_shape.is_empty() {
            return invalid("fallback_output_shape must be non-zero".into());
        }
        if self.pool.max_pool_size_bytes == 0 {
            return invalid("max_pool_size_bytes must be > 0".into());
        }
        if self.pool.leak_trend_window < 2 {
            return invalid("leak_trend_window must be >= 2".into());
        }
        Ok(())
    }
}
