//! Pooled image buffers

use std::sync::atomic::{AtomicU64, Ordering};

use super::video::{FilterMode, PixelFormat, Resolution};
use crate::{Error, Result};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an image buffer instance
///
/// Every allocation receives a fresh id; the pool uses it to decide whether a
/// released buffer is one of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Pixel buffer at a fixed (width, height, format)
///
/// Values are normalized `f32` samples, `channels` per pixel, row-major.
/// The filter mode records how the buffer should be sampled when it is read
/// by a consumer; operations inside the pipeline pass their sampling mode
/// explicitly.
#[derive(Debug)]
pub struct ImageBuffer {
    id: BufferId,
    resolution: Resolution,
    format: PixelFormat,
    filter_mode: FilterMode,
    data: Vec<f32>,
}

impl ImageBuffer {
    /// Allocate a zeroed buffer
    pub fn new(resolution: Resolution, format: PixelFormat) -> Result<Self> {
        let channels = format.channels().ok_or_else(|| {
            Error::InvalidData(format!("{:?} cannot back an image buffer", format))
        })?;
        if resolution.is_empty() {
            return Err(Error::InvalidData(format!(
                "image buffer needs non-zero dimensions, got {}",
                resolution
            )));
        }
        Ok(Self {
            id: BufferId::next(),
            resolution,
            format,
            filter_mode: FilterMode::Point,
            data: vec![0.0; resolution.pixel_count() * channels],
        })
    }

    /// Zero-sized stand-in left behind when a pooled buffer is handed back
    pub(crate) fn placeholder() -> Self {
        Self {
            id: BufferId(0),
            resolution: Resolution::new(0, 0),
            format: PixelFormat::RFloat,
            filter_mode: FilterMode::Point,
            data: Vec::new(),
        }
    }

    /// Buffer identity
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Buffer resolution
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Pixel format
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Interleaved channel count
    pub fn channels(&self) -> usize {
        self.data.len() / self.resolution.pixel_count()
    }

    /// Sampling mode advertised to consumers
    pub fn filter_mode(&self) -> FilterMode {
        self.filter_mode
    }

    /// Change the advertised sampling mode
    pub fn set_filter_mode(&mut self, mode: FilterMode) {
        self.filter_mode = mode;
    }

    /// Sample storage
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable sample storage
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Footprint used for pool accounting
    pub fn byte_size(&self) -> usize {
        self.resolution.pixel_count() * self.format.bytes_per_pixel()
    }

    /// Read one sample
    #[inline]
    pub fn get(&self, x: u32, y: u32, channel: usize) -> f32 {
        let idx = (y as usize * self.resolution.width as usize + x as usize) * self.channels()
            + channel;
        self.data[idx]
    }

    /// Reset every sample to zero
    pub fn clear(&mut self) {
        self.fill(0.0);
    }

    /// Set every sample to `value`
    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|v| *v = value);
    }

    /// Copy samples from a buffer of identical shape
    pub fn copy_from(&mut self, other: &ImageBuffer) -> Result<()> {
        if other.resolution != self.resolution || other.channels() != self.channels() {
            return Err(Error::InvalidData(format!(
                "cannot copy {} x{} into {} x{}",
                other.resolution,
                other.channels(),
                self.resolution,
                self.channels()
            )));
        }
        self.data.copy_from_slice(&other.data);
        Ok(())
    }

    /// Deep copy with a fresh identity
    pub fn duplicate(&self) -> ImageBuffer {
        ImageBuffer {
            id: BufferId::next(),
            resolution: self.resolution,
            format: self.format,
            filter_mode: self.filter_mode,
            data: self.data.clone(),
        }
    }

    /// Fraction of pixels whose first channel exceeds `threshold`
    pub fn fraction_above(&self, threshold: f32) -> f32 {
        let channels = self.channels();
        let hits = self
            .data
            .chunks_exact(channels)
            .filter(|px| px[0] > threshold)
            .count();
        hits as f32 / self.resolution.pixel_count() as f32
    }
}
