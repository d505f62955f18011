//! Raw camera frames

use bytes::Bytes;

use super::video::{PixelFormat, Resolution};
use crate::{Error, Result};

/// Camera image handed to the scheduler for one run
///
/// The pixel bytes are reference counted, so cloning a frame never copies
/// image data. Frames are never pooled and never mutated by the pipeline.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Pixel bytes in `format` layout
    pub data: Bytes,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Pixel layout
    pub format: PixelFormat,
    /// Monotonic frame counter from the source
    pub frame_number: u64,
    /// Capture timestamp in microseconds
    pub timestamp_us: u64,
}

impl RawFrame {
    /// Create a new frame
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            format,
            frame_number: 0,
            timestamp_us: 0,
        }
    }

    /// Set the frame number
    pub fn with_frame_number(mut self, frame_number: u64) -> Self {
        self.frame_number = frame_number;
        self
    }

    /// Set the capture timestamp
    pub fn with_timestamp_us(mut self, timestamp_us: u64) -> Self {
        self.timestamp_us = timestamp_us;
        self
    }

    /// Native resolution
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Check that the byte length and dimensions agree with the format
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidData(format!(
                "frame {} has zero dimension {}x{}",
                self.frame_number, self.width, self.height
            )));
        }
        if self.format.requires_even_dimensions() && (self.width % 2 != 0 || self.height % 2 != 0) {
            return Err(Error::InvalidData(format!(
                "{:?} frame requires even dimensions, got {}x{}",
                self.format, self.width, self.height
            )));
        }
        if matches!(self.format, PixelFormat::R8 | PixelFormat::RFloat) {
            return Err(Error::InvalidData(format!(
                "{:?} is not a camera layout",
                self.format
            )));
        }
        let expected = self.format.buffer_size(self.width, self.height);
        if self.data.len() < expected {
            return Err(Error::InvalidData(format!(
                "frame {} holds {} bytes, {:?} {}x{} needs {}",
                self.frame_number,
                self.data.len(),
                self.format,
                self.width,
                self.height,
                expected
            )));
        }
        Ok(())
    }
}
