//! Mask reconstruction
//!
//! Turns an inference result tensor into the display mask in four ordered
//! stages:
//!
//! 1. direct render of the selected channel into the low-resolution mask
//!    (point sampled, mandatory)
//! 2. denoise of the low-resolution mask (optional)
//! 3. bilinear upscale into the display mask (mandatory)
//! 4. temporal blend with the previous display mask (optional)
//!
//! The low-resolution mask follows the inference output shape and is only
//! reallocated when that shape changes. The display mask keeps its resolution
//! for the reconstructor's lifetime. The previous mask used for blending
//! never leaves this module.

pub mod filters;
pub mod stages;

pub use stages::{BlurThresholdDenoiser, Denoiser, TemporalBlender, WeightedBlender};

use bitflags::bitflags;
use std::sync::Arc;
use std::time::{Duration, Instant as WallInstant};
use tokio::time::Instant;

use crate::config::{ReconstructionConfig, SegmentationConfig};
use crate::data::{FilterMode, ImageBuffer, PixelFormat, Resolution};
use crate::pool::{PooledImage, ResourcePool};
use crate::tensor::{TensorBuffer, TensorShape};
use crate::{Error, Result};

/// Format of both mask resolutions
pub const MASK_FORMAT: PixelFormat = PixelFormat::RFloat;

bitflags! {
    /// Optional stages that did not contribute to a mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Degradation: u8 {
        /// Denoise requested but no denoiser installed
        const DENOISE_SKIPPED = 0b0000_0001;
        /// Denoiser returned an error, unsmoothed mask kept
        const DENOISE_FAILED = 0b0000_0010;
        /// Temporal blend requested but no blender installed
        const TEMPORAL_SKIPPED = 0b0000_0100;
        /// Blender returned an error, unblended mask kept
        const TEMPORAL_FAILED = 0b0000_1000;
        /// Previous mask had a different resolution and was discarded
        const TEMPORAL_RESET = 0b0001_0000;
    }
}

/// Wall-clock time spent in each stage
#[derive(Debug, Clone, Copy, Default)]
pub struct StageTimings {
    /// Direct render
    pub render: Duration,
    /// Denoise (zero when skipped)
    pub denoise: Duration,
    /// Upscale
    pub upscale: Duration,
    /// Temporal blend (zero when skipped)
    pub blend: Duration,
}

/// Outcome of one reconstruction
#[derive(Debug, Clone)]
pub struct ReconstructionReport {
    /// Optional stages that were skipped or failed
    pub degradation: Degradation,
    /// Per-stage timings
    pub timings: StageTimings,
    /// Resolution of the low-resolution mask used
    pub low_res: Resolution,
}

impl ReconstructionReport {
    /// Whether any optional stage was missing from this mask
    pub fn is_degraded(&self) -> bool {
        !self.degradation.is_empty()
    }
}

struct PreviousMask {
    mask: PooledImage,
    produced_at: Instant,
}

/// Four-stage result-to-display-mask pipeline
pub struct MaskReconstructor {
    pool: Arc<ResourcePool>,
    config: ReconstructionConfig,
    mask_channel: usize,
    low_res: PooledImage,
    display: PooledImage,
    previous: Option<PreviousMask>,
    denoiser: Option<Box<dyn Denoiser>>,
    blender: Option<Box<dyn TemporalBlender>>,
}

impl MaskReconstructor {
    /// Create a reconstructor for the given inference output shape
    ///
    /// Installs the default denoiser and blender when they are enabled in
    /// `config`.
    pub fn new(
        pool: Arc<ResourcePool>,
        config: &SegmentationConfig,
        output_shape: TensorShape,
    ) -> Result<Self> {
        let rc = config.reconstruction.clone();
        let low_res = pool.acquire(shape_resolution(output_shape)?, MASK_FORMAT)?;
        let mut display_mask = pool.acquire(config.display_resolution, MASK_FORMAT)?;
        display_mask.clear();
        display_mask.set_filter_mode(FilterMode::Bilinear);

        let denoiser: Option<Box<dyn Denoiser>> = if rc.enable_denoise {
            Some(Box::new(BlurThresholdDenoiser::from_config(&rc)))
        } else {
            None
        };
        let blender: Option<Box<dyn TemporalBlender>> = if rc.enable_temporal_blend {
            Some(Box::new(WeightedBlender::new(
                rc.temporal_blend_factor,
                rc.temporal_blend_mode,
                config.blend_reference_interval(),
            )))
        } else {
            None
        };

        tracing::debug!(
            "Mask reconstructor: low-res {}, display {}, denoise {}, temporal {}",
            low_res.resolution(),
            display_mask.resolution(),
            denoiser.is_some(),
            blender.is_some()
        );

        Ok(Self {
            pool,
            config: rc,
            mask_channel: config.inference.mask_channel,
            low_res,
            display: display_mask,
            previous: None,
            denoiser,
            blender,
        })
    }

    /// Replace (or remove) the denoise capability
    pub fn with_denoiser(mut self, denoiser: Option<Box<dyn Denoiser>>) -> Self {
        self.denoiser = denoiser;
        self
    }

    /// Replace (or remove) the temporal blend capability
    pub fn with_blender(mut self, blender: Option<Box<dyn TemporalBlender>>) -> Self {
        self.blender = blender;
        self
    }

    /// The display mask as of the last reconstruction
    pub fn display_mask(&self) -> &ImageBuffer {
        &self.display
    }

    /// The low-resolution mask as of the last reconstruction
    pub fn low_res_mask(&self) -> &ImageBuffer {
        &self.low_res
    }

    /// Run all four stages for `result`
    ///
    /// Returns an error only when a mandatory stage fails; the display mask
    /// must not be published in that case.
    pub fn reconstruct(&mut self, result: &TensorBuffer, now: Instant) -> Result<ReconstructionReport> {
        let mut degradation = Degradation::empty();
        let mut timings = StageTimings::default();

        let started = WallInstant::now();
        self.render(result)
            .map_err(|e| Error::reconstruction("render", e.to_string()))?;
        timings.render = started.elapsed();

        let started = WallInstant::now();
        degradation |= self.denoise();
        timings.denoise = started.elapsed();

        let started = WallInstant::now();
        self.upscale()
            .map_err(|e| Error::reconstruction("upscale", e.to_string()))?;
        timings.upscale = started.elapsed();

        let started = WallInstant::now();
        degradation |= self.temporal_blend(now);
        timings.blend = started.elapsed();

        Ok(ReconstructionReport {
            degradation,
            timings,
            low_res: self.low_res.resolution(),
        })
    }

    fn render(&mut self, result: &TensorBuffer) -> Result<()> {
        let shape = result.shape();
        let required = shape_resolution(shape)?;
        if self.low_res.resolution() != required {
            tracing::info!(
                "Inference output changed to {}, reallocating low-res mask (was {})",
                required,
                self.low_res.resolution()
            );
            self.low_res = self.pool.acquire(required, MASK_FORMAT)?;
        }

        let plane = result.channel(self.mask_channel)?;
        self.low_res.clear();
        self.low_res.set_filter_mode(FilterMode::Point);
        filters::render_plane(plane, shape.height, shape.width, &mut self.low_res)
    }

    fn denoise(&mut self) -> Degradation {
        let Some(denoiser) = self.denoiser.as_mut() else {
            if self.config.enable_denoise {
                tracing::debug!("Denoise capability unavailable, using unsmoothed mask");
                return Degradation::DENOISE_SKIPPED;
            }
            return Degradation::empty();
        };

        let mut scratch = match self.pool.acquire(self.low_res.resolution(), MASK_FORMAT) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!("Denoise scratch buffer unavailable: {}", e);
                return Degradation::DENOISE_FAILED;
            }
        };
        match denoiser.denoise(&self.low_res, &mut scratch) {
            Ok(()) => {
                scratch.set_filter_mode(FilterMode::Point);
                std::mem::swap(&mut self.low_res, &mut scratch);
                Degradation::empty()
            }
            Err(e) => {
                tracing::warn!("Denoiser '{}' failed, using unsmoothed mask: {}", denoiser.name(), e);
                Degradation::DENOISE_FAILED
            }
        }
    }

    fn upscale(&mut self) -> Result<()> {
        filters::resample(&self.low_res, &mut self.display, FilterMode::Bilinear)?;
        self.display.set_filter_mode(FilterMode::Bilinear);
        Ok(())
    }

    fn temporal_blend(&mut self, now: Instant) -> Degradation {
        let Some(blender) = self.blender.as_mut() else {
            if self.config.enable_temporal_blend {
                tracing::debug!("Temporal blend capability unavailable, using unblended mask");
                return Degradation::TEMPORAL_SKIPPED;
            }
            return Degradation::empty();
        };

        let mut degradation = Degradation::empty();
        if let Some(prev) = self.previous.as_ref() {
            if prev.mask.resolution() != self.display.resolution() {
                tracing::debug!(
                    "Previous mask {} does not match display {}, resetting temporal state",
                    prev.mask.resolution(),
                    self.display.resolution()
                );
                self.previous = None;
                degradation |= Degradation::TEMPORAL_RESET;
            }
        }

        if let Some(prev) = self.previous.as_ref() {
            let elapsed = now.saturating_duration_since(prev.produced_at);
            if let Err(e) = blender.blend(&prev.mask, &mut self.display, elapsed) {
                tracing::warn!("Blender '{}' failed, using unblended mask: {}", blender.name(), e);
                degradation |= Degradation::TEMPORAL_FAILED;
            }
        }

        let retained = match self.previous.as_mut() {
            Some(prev) => match prev.mask.copy_from(&self.display) {
                Ok(()) => {
                    prev.produced_at = now;
                    true
                }
                Err(e) => {
                    tracing::warn!("Could not retain previous mask: {}", e);
                    false
                }
            },
            None => false,
        };
        if !retained {
            self.previous = self.snapshot_display(now);
        }
        degradation
    }

    fn snapshot_display(&self, now: Instant) -> Option<PreviousMask> {
        let mut mask = match self.pool.acquire(self.display.resolution(), MASK_FORMAT) {
            Ok(mask) => mask,
            Err(e) => {
                tracing::warn!("Previous mask buffer unavailable: {}", e);
                return None;
            }
        };
        mask.copy_from(&self.display).ok()?;
        Some(PreviousMask {
            mask,
            produced_at: now,
        })
    }
}

fn shape_resolution(shape: TensorShape) -> Result<Resolution> {
    if shape.is_empty() {
        return Err(Error::InvalidData(format!("empty output shape {}", shape)));
    }
    let width = u32::try_from(shape.width)
        .map_err(|_| Error::InvalidData(format!("output width {} too large", shape.width)))?;
    let height = u32::try_from(shape.height)
        .map_err(|_| Error::InvalidData(format!("output height {} too large", shape.height)))?;
    Ok(Resolution::new(width, height))
}
