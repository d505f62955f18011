//! Raw frame to tensor-ready image conversion
//!
//! A converter receives the run's raw camera frame and a pooled RGBA output
//! buffer at the working resolution. It may suspend once while the
//! conversion completes. On error the caller drops the output guard, which
//! returns the buffer to the pool, and abandons the run.

pub mod cpu;

pub use cpu::{ColorMatrix, CpuConverterConfig, CpuFrameConverter};

use async_trait::async_trait;

use crate::data::{ImageBuffer, PixelFormat, RawFrame};
use crate::Result;

/// Format conversion backend
#[async_trait]
pub trait FrameConverter: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Whether frames in `format` can be converted
    fn supports(&self, format: PixelFormat) -> bool;

    /// Convert `frame` into `output`, resampling to the output's resolution
    ///
    /// Errors are reported as [`crate::Error::Conversion`].
    async fn convert(&self, frame: &RawFrame, output: &mut ImageBuffer) -> Result<()>;
}
