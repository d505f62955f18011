//! Optional reconstruction capabilities
//!
//! Denoise and temporal blend are pluggable. The reconstructor runs without
//! either; a missing or failing capability degrades the mask but never fails
//! the run.

use std::time::Duration;

use super::filters;
use crate::config::{BlendMode, ReconstructionConfig, MAX_DENOISE_RADIUS};
use crate::data::ImageBuffer;
use crate::Result;

/// Low-resolution mask smoothing
pub trait Denoiser: Send {
    /// Capability name for logs
    fn name(&self) -> &str;

    /// Write the smoothed version of `src` into `dst` (same shape)
    fn denoise(&mut self, src: &ImageBuffer, dst: &mut ImageBuffer) -> Result<()>;
}

/// Box blur followed by fixed-threshold re-binarization
#[derive(Debug, Clone)]
pub struct BlurThresholdDenoiser {
    radius: u32,
    threshold: f32,
}

impl BlurThresholdDenoiser {
    /// Create a denoiser with the given kernel radius and threshold
    ///
    /// The radius is capped at [`MAX_DENOISE_RADIUS`].
    pub fn new(radius: u32, threshold: f32) -> Self {
        Self {
            radius: radius.min(MAX_DENOISE_RADIUS),
            threshold,
        }
    }

    /// Denoiser configured from reconstruction settings
    pub fn from_config(config: &ReconstructionConfig) -> Self {
        Self::new(config.denoise_radius, config.denoise_threshold)
    }
}

impl Denoiser for BlurThresholdDenoiser {
    fn name(&self) -> &str {
        "blur-threshold"
    }

    fn denoise(&mut self, src: &ImageBuffer, dst: &mut ImageBuffer) -> Result<()> {
        filters::box_blur(src, dst, self.radius)?;
        filters::threshold_in_place(dst, self.threshold);
        Ok(())
    }
}

/// Display mask smoothing across runs
pub trait TemporalBlender: Send {
    /// Capability name for logs
    fn name(&self) -> &str;

    /// Blend `previous` into `current` in place; `elapsed` is the time since
    /// `previous` was produced
    fn blend(&mut self, previous: &ImageBuffer, current: &mut ImageBuffer, elapsed: Duration) -> Result<()>;
}

/// Linear or exponential weighting towards the current mask
#[derive(Debug, Clone)]
pub struct WeightedBlender {
    factor: f32,
    mode: BlendMode,
    reference_interval: Duration,
}

impl WeightedBlender {
    /// Create a blender
    ///
    /// `reference_interval` is the frame interval at which the exponential
    /// weight equals `factor`.
    pub fn new(factor: f32, mode: BlendMode, reference_interval: Duration) -> Self {
        Self {
            factor,
            mode,
            reference_interval,
        }
    }

    /// Weight given to the current mask for a frame `elapsed` after the previous one
    pub fn weight(&self, elapsed: Duration) -> f32 {
        match self.mode {
            BlendMode::Linear => self.factor,
            BlendMode::Exponential => {
                let reference = self.reference_interval.as_secs_f32();
                let ratio = elapsed.as_secs_f32() / reference;
                if !(ratio.is_finite() && ratio > 0.0) {
                    return self.factor;
                }
                (1.0 - (1.0 - self.factor).powf(ratio)).clamp(f32::EPSILON, 1.0)
            }
        }
    }
}

impl TemporalBlender for WeightedBlender {
    fn name(&self) -> &str {
        match self.mode {
            BlendMode::Linear => "linear",
            BlendMode::Exponential => "exponential",
        }
    }

    fn blend(&mut self, previous: &ImageBuffer, current: &mut ImageBuffer, elapsed: Duration) -> Result<()> {
        filters::lerp_in_place(previous, current, self.weight(elapsed))
    }
}
