//! Single-channel mask kernels
//!
//! All kernels read the first channel of their inputs and write every
//! channel of single-channel outputs. Sampling modes are explicit arguments;
//! a buffer's own advertised filter mode is never consulted.

use crate::data::{FilterMode, ImageBuffer};
use crate::{Error, Result};

fn require_single_channel(buf: &ImageBuffer, what: &str) -> Result<()> {
    if buf.channels() != 1 {
        return Err(Error::InvalidData(format!(
            "{} must be single-channel, got {} channels",
            what,
            buf.channels()
        )));
    }
    Ok(())
}

fn require_same_shape(a: &ImageBuffer, b: &ImageBuffer) -> Result<()> {
    if a.resolution() != b.resolution() {
        return Err(Error::InvalidData(format!(
            "resolution mismatch {} vs {}",
            a.resolution(),
            b.resolution()
        )));
    }
    Ok(())
}

/// Copy an HxW plane into `dst` one texel per element
pub fn render_plane(plane: &[f32], height: usize, width: usize, dst: &mut ImageBuffer) -> Result<()> {
    require_single_channel(dst, "render target")?;
    if dst.width() as usize != width || dst.height() as usize != height {
        return Err(Error::InvalidData(format!(
            "plane {}x{} does not match render target {}",
            width,
            height,
            dst.resolution()
        )));
    }
    if plane.len() != width * height {
        return Err(Error::InvalidData(format!(
            "plane holds {} values, expected {}",
            plane.len(),
            width * height
        )));
    }
    dst.data_mut().copy_from_slice(plane);
    Ok(())
}

/// Box blur with edge clamping
pub fn box_blur(src: &ImageBuffer, dst: &mut ImageBuffer, radius: u32) -> Result<()> {
    require_single_channel(src, "blur source")?;
    require_single_channel(dst, "blur target")?;
    require_same_shape(src, dst)?;

    let w = src.width() as i64;
    let h = src.height() as i64;
    let r = radius as i64;
    let input = src.data();
    let out = dst.data_mut();

    for y in 0..h {
        for x in 0..w {
            let mut sum = 0.0f32;
            let mut n = 0u32;
            for dy in -r..=r {
                let sy = (y + dy).clamp(0, h - 1);
                for dx in -r..=r {
                    let sx = (x + dx).clamp(0, w - 1);
                    sum += input[(sy * w + sx) as usize];
                    n += 1;
                }
            }
            out[(y * w + x) as usize] = sum / n as f32;
        }
    }
    Ok(())
}

/// Re-binarize: values at or above `threshold` become 1.0, the rest 0.0
pub fn threshold_in_place(buf: &mut ImageBuffer, threshold: f32) {
    for v in buf.data_mut() {
        *v = if *v >= threshold { 1.0 } else { 0.0 };
    }
}

/// Resample `src` into `dst` with the given sampling mode
///
/// Uses pixel-centre alignment and clamps at the edges, so a uniform source
/// produces a uniform destination.
pub fn resample(src: &ImageBuffer, dst: &mut ImageBuffer, mode: FilterMode) -> Result<()> {
    require_single_channel(src, "resample source")?;
    require_single_channel(dst, "resample target")?;

    let (src_w, src_h) = (src.width(), src.height());
    let (dst_w, dst_h) = (dst.width(), dst.height());
    let scale_x = src_w as f32 / dst_w as f32;
    let scale_y = src_h as f32 / dst_h as f32;
    let max_x = (src_w - 1) as f32;
    let max_y = (src_h - 1) as f32;
    let input = src.data();
    let stride = src_w as usize;
    let out = dst.data_mut();

    for oy in 0..dst_h {
        let sy = ((oy as f32 + 0.5) * scale_y - 0.5).clamp(0.0, max_y);
        for ox in 0..dst_w {
            let sx = ((ox as f32 + 0.5) * scale_x - 0.5).clamp(0.0, max_x);
            let value = match mode {
                FilterMode::Point => {
                    let x = sx.round() as usize;
                    let y = sy.round() as usize;
                    input[y * stride + x]
                }
                FilterMode::Bilinear => {
                    let x0 = sx.floor() as usize;
                    let y0 = sy.floor() as usize;
                    let x1 = (x0 + 1).min(src_w as usize - 1);
                    let y1 = (y0 + 1).min(src_h as usize - 1);
                    let fx = sx - x0 as f32;
                    let fy = sy - y0 as f32;
                    let top = input[y0 * stride + x0]
                        + (input[y0 * stride + x1] - input[y0 * stride + x0]) * fx;
                    let bottom = input[y1 * stride + x0]
                        + (input[y1 * stride + x1] - input[y1 * stride + x0]) * fx;
                    top + (bottom - top) * fy
                }
            };
            out[oy as usize * dst_w as usize + ox as usize] = value;
        }
    }
    Ok(())
}

/// `current = previous + (current - previous) * weight`
pub fn lerp_in_place(previous: &ImageBuffer, current: &mut ImageBuffer, weight: f32) -> Result<()> {
    require_same_shape(previous, current)?;
    if previous.channels() != current.channels() {
        return Err(Error::InvalidData("channel count mismatch".into()));
    }
    for (cur, prev) in current.data_mut().iter_mut().zip(previous.data()) {
        *cur = prev + (*cur - prev) * weight;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{PixelFormat, Resolution};

    fn mask(w: u32, h: u32, values: &[f32]) -> ImageBuffer {
        let mut buf = ImageBuffer::new(Resolution::new(w, h), PixelFormat::RFloat).unwrap();
        buf.data_mut().copy_from_slice(values);
        buf
    }

    #[test]
    fn test_render_plane_is_verbatim() {
        let mut dst = ImageBuffer::new(Resolution::new(2, 2), PixelFormat::RFloat).unwrap();
        render_plane(&[0.1, 0.9, 0.4, 0.6], 2, 2, &mut dst).unwrap();
        assert_eq!(dst.data(), &[0.1, 0.9, 0.4, 0.6]);
        assert!(render_plane(&[0.0; 6], 2, 3, &mut dst).is_err());
    }

    #[test]
    fn test_blur_preserves_uniform() {
        let src = mask(3, 3, &[1.0; 9]);
        let mut dst = ImageBuffer::new(Resolution::new(3, 3), PixelFormat::RFloat).unwrap();
        box_blur(&src, &mut dst, 1).unwrap();
        assert!(dst.data().iter().all(|v| *v == 1.0));
    }

    #[test]
    fn test_blur_then_threshold_removes_speckle() {
        let mut values = [0.0f32; 25];
        values[12] = 1.0;
        let src = mask(5, 5, &values);
        let mut dst = ImageBuffer::new(Resolution::new(5, 5), PixelFormat::RFloat).unwrap();
        box_blur(&src, &mut dst, 1).unwrap();
        threshold_in_place(&mut dst, 0.5);
        assert!(dst.data().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_bilinear_upscale_of_uniform_is_uniform() {
        let src = mask(2, 2, &[1.0; 4]);
        let mut dst = ImageBuffer::new(Resolution::new(64, 48), PixelFormat::RFloat).unwrap();
        resample(&src, &mut dst, FilterMode::Bilinear).unwrap();
        assert!(dst.data().iter().all(|v| *v == 1.0));
    }

    #[test]
    fn test_bilinear_interpolates_between_texels() {
        let src = mask(2, 1, &[0.0, 1.0]);
        let mut dst = ImageBuffer::new(Resolution::new(4, 1), PixelFormat::RFloat).unwrap();
        resample(&src, &mut dst, FilterMode::Bilinear).unwrap();
        assert_eq!(dst.data()[0], 0.0);
        assert!((dst.data()[1] - 0.25).abs() < 1e-6);
        assert!((dst.data()[2] - 0.75).abs() < 1e-6);
        assert_eq!(dst.data()[3], 1.0);

        resample(&src, &mut dst, FilterMode::Point).unwrap();
        assert!(dst.data().iter().all(|v| *v == 0.0 || *v == 1.0));
    }

    #[test]
    fn test_lerp() {
        let prev = mask(1, 2, &[0.0, 1.0]);
        let mut cur = mask(1, 2, &[1.0, 0.0]);
        lerp_in_place(&prev, &mut cur, 0.25).unwrap();
        assert!((cur.data()[0] - 0.25).abs() < 1e-6);
        assert!((cur.data()[1] - 0.75).abs() < 1e-6);
    }
}
