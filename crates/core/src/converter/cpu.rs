//! CPU frame converter
//!
//! Decodes packed RGB(A)/BGRA and YUV 4:2:0 camera layouts and bilinearly
//! resamples them into an RGBA output buffer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::FrameConverter;
use crate::data::{ImageBuffer, PixelFormat, RawFrame};
use crate::{Error, Result};

/// YUV to RGB matrix (full range)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMatrix {
    /// ITU-R BT.601
    #[default]
    Bt601,
    /// ITU-R BT.709
    Bt709,
}

impl ColorMatrix {
    // (r_v, g_u, g_v, b_u)
    fn coefficients(&self) -> (f32, f32, f32, f32) {
        match self {
            ColorMatrix::Bt601 => (1.402, 0.344_136, 0.714_136, 1.772),
            ColorMatrix::Bt709 => (1.5748, 0.187_324, 0.468_124, 1.8556),
        }
    }
}

/// Configuration for the CPU converter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuConverterConfig {
    /// Matrix used for YUV sources
    #[serde(default)]
    pub color_matrix: ColorMatrix,
}

/// Software converter with bilinear resampling
#[derive(Debug, Clone, Default)]
pub struct CpuFrameConverter {
    config: CpuConverterConfig,
}

impl CpuFrameConverter {
    /// Create a converter
    pub fn new(config: CpuConverterConfig) -> Self {
        Self { config }
    }

    fn fetch_rgb(&self, frame: &RawFrame, x: u32, y: u32) -> [f32; 3] {
        let data = &frame.data;
        let w = frame.width as usize;
        let h = frame.height as usize;
        let (x, y) = (x as usize, y as usize);
        match frame.format {
            PixelFormat::Rgb24 => {
                let i = (y * w + x) * 3;
                [norm(data[i]), norm(data[i + 1]), norm(data[i + 2])]
            }
            PixelFormat::Rgba32 => {
                let i = (y * w + x) * 4;
                [norm(data[i]), norm(data[i + 1]), norm(data[i + 2])]
            }
            PixelFormat::Bgra32 => {
                let i = (y * w + x) * 4;
                [norm(data[i + 2]), norm(data[i + 1]), norm(data[i])]
            }
            PixelFormat::Yuv420p | PixelFormat::I420 => {
                let luma = data[y * w + x];
                let cw = w / 2;
                let ci = (y / 2) * cw + x / 2;
                let u_plane = w * h;
                let v_plane = u_plane + cw * (h / 2);
                self.yuv_to_rgb(luma, data[u_plane + ci], data[v_plane + ci])
            }
            PixelFormat::NV12 => {
                let luma = data[y * w + x];
                let uv = w * h + (y / 2) * w + (x / 2) * 2;
                self.yuv_to_rgb(luma, data[uv], data[uv + 1])
            }
            PixelFormat::R8 | PixelFormat::RFloat => [0.0; 3],
        }
    }

    fn yuv_to_rgb(&self, y: u8, u: u8, v: u8) -> [f32; 3] {
        let (r_v, g_u, g_v, b_u) = self.config.color_matrix.coefficients();
        let y = y as f32;
        let u = u as f32 - 128.0;
        let v = v as f32 - 128.0;
        [
            ((y + r_v * v) / 255.0).clamp(0.0, 1.0),
            ((y - g_u * u - g_v * v) / 255.0).clamp(0.0, 1.0),
            ((y + b_u * u) / 255.0).clamp(0.0, 1.0),
        ]
    }

    fn resample_into(&self, frame: &RawFrame, output: &mut ImageBuffer) {
        let (src_w, src_h) = (frame.width, frame.height);
        let (dst_w, dst_h) = (output.width(), output.height());
        let scale_x = src_w as f32 / dst_w as f32;
        let scale_y = src_h as f32 / dst_h as f32;
        let max_x = (src_w - 1) as f32;
        let max_y = (src_h - 1) as f32;

        let out = output.data_mut();
        for oy in 0..dst_h {
            let sy = ((oy as f32 + 0.5) * scale_y - 0.5).clamp(0.0, max_y);
            let y0 = sy.floor() as u32;
            let y1 = (y0 + 1).min(src_h - 1);
            let fy = sy - y0 as f32;
            for ox in 0..dst_w {
                let sx = ((ox as f32 + 0.5) * scale_x - 0.5).clamp(0.0, max_x);
                let x0 = sx.floor() as u32;
                let x1 = (x0 + 1).min(src_w - 1);
                let fx = sx - x0 as f32;

                let p00 = self.fetch_rgb(frame, x0, y0);
                let p10 = self.fetch_rgb(frame, x1, y0);
                let p01 = self.fetch_rgb(frame, x0, y1);
                let p11 = self.fetch_rgb(frame, x1, y1);

                let i = (oy as usize * dst_w as usize + ox as usize) * 4;
                for c in 0..3 {
                    let top = p00[c] + (p10[c] - p00[c]) * fx;
                    let bottom = p01[c] + (p11[c] - p01[c]) * fx;
                    out[i + c] = top + (bottom - top) * fy;
                }
                out[i + 3] = 1.0;
            }
        }
    }
}

#[inline]
fn norm(v: u8) -> f32 {
    v as f32 / 255.0
}

#[async_trait]
impl FrameConverter for CpuFrameConverter {
    fn name(&self) -> &str {
        "cpu"
    }

    fn supports(&self, format: PixelFormat) -> bool {
        !matches!(format, PixelFormat::R8 | PixelFormat::RFloat)
    }

    async fn convert(&self, frame: &RawFrame, output: &mut ImageBuffer) -> Result<()> {
        if !self.supports(frame.format) {
            return Err(Error::Conversion(format!(
                "unsupported source format {:?}",
                frame.format
            )));
        }
        frame
            .validate()
            .map_err(|e| Error::Conversion(e.to_string()))?;
        if output.format() != PixelFormat::Rgba32 {
            return Err(Error::Conversion(format!(
                "output buffer must be Rgba32, got {:?}",
                output.format()
            )));
        }

        // Conversion completes asynchronously relative to the caller
        tokio::task::yield_now().await;

        self.resample_into(frame, output);
        tracing::trace!(
            "Converted frame {} {:?} {}x{} -> {}",
            frame.frame_number,
            frame.format,
            frame.width,
            frame.height,
            output.resolution()
        );
        Ok(())
    }
}
