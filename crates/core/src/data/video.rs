//! Pixel formats, resolutions and sampling modes
//!
//! Raw camera frames arrive in any of the packed or planar layouts below.
//! Pooled image buffers only ever use the packed formats, stored as
//! normalized `f32` per channel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel format for raw frames and pooled image buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar
    /// Layout: Y plane (width*height), U plane (width/2 * height/2), V plane (width/2 * height/2)
    Yuv420p = 1,

    /// I420 (identical to YUV420P)
    I420 = 2,

    /// NV12 (semi-planar, Y plane + interleaved UV)
    /// Layout: Y plane (width*height), UV plane (width * height/2)
    /// Use case: most mobile camera pipelines
    NV12 = 3,

    /// RGB24 (packed 24-bit RGB)
    Rgb24 = 4,

    /// RGBA32 (packed 32-bit RGBA with alpha)
    /// Use case: tensor-ready converter output
    Rgba32 = 5,

    /// BGRA32 (packed 32-bit BGRA, common desktop camera layout)
    Bgra32 = 6,

    /// Single 8-bit channel (display masks consumed by shaders)
    R8 = 7,

    /// Single 32-bit float channel (confidence masks)
    RFloat = 8,
}

impl PixelFormat {
    /// Calculate expected raw buffer size in bytes
    pub fn buffer_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Yuv420p | PixelFormat::I420 | PixelFormat::NV12 => pixels * 3 / 2,
            PixelFormat::Rgb24 => pixels * 3,
            PixelFormat::Rgba32 | PixelFormat::Bgra32 | PixelFormat::RFloat => pixels * 4,
            PixelFormat::R8 => pixels,
        }
    }

    /// Bytes per pixel used for pool accounting
    ///
    /// Planar formats report their luma byte; they are never pooled.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Yuv420p | PixelFormat::I420 | PixelFormat::NV12 | PixelFormat::R8 => 1,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba32 | PixelFormat::Bgra32 | PixelFormat::RFloat => 4,
        }
    }

    /// Number of interleaved channels, `None` for planar layouts
    pub fn channels(&self) -> Option<usize> {
        match self {
            PixelFormat::Yuv420p | PixelFormat::I420 | PixelFormat::NV12 => None,
            PixelFormat::Rgb24 => Some(3),
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => Some(4),
            PixelFormat::R8 | PixelFormat::RFloat => Some(1),
        }
    }

    /// Check if format requires even dimensions (YUV formats)
    pub fn requires_even_dimensions(&self) -> bool {
        matches!(
            self,
            PixelFormat::Yuv420p | PixelFormat::I420 | PixelFormat::NV12
        )
    }
}

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Resolution {
    /// Create a new resolution
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Total pixel count
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether either dimension is zero
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Component-wise clamp into `[min, max]`
    pub fn clamp(self, min: Resolution, max: Resolution) -> Resolution {
        Resolution {
            width: self.width.clamp(min.width, max.width),
            height: self.height.clamp(min.height, max.height),
        }
    }

    /// Whether both components lie within `[min, max]`
    pub fn within(&self, min: Resolution, max: Resolution) -> bool {
        (min.width..=max.width).contains(&self.width)
            && (min.height..=max.height).contains(&self.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Sampling filter used when a buffer is read at non-integer coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Nearest-neighbour sampling
    #[default]
    Point,
    /// Bilinear interpolation
    Bilinear,
}
