//! Frame sources for [`crate::FrameScheduler::tick`]
//!
//! A source is polled once per admitted tick and may have nothing to offer.
//! [`FallbackFrameSource`] switches to generated frames after a run of empty
//! polls, so the pipeline keeps producing masks when the camera goes away.

use bytes::Bytes;

use crate::data::{PixelFormat, RawFrame, Resolution};

/// Pull-style frame provider
pub trait FrameSource: Send {
    /// Latest frame, if one is available
    fn try_acquire_frame(&mut self) -> Option<RawFrame>;
}

impl<F> FrameSource for F
where
    F: FnMut() -> Option<RawFrame> + Send,
{
    fn try_acquire_frame(&mut self) -> Option<RawFrame> {
        self()
    }
}

/// Generated RGBA frames: a dark background with a bright panel that
/// drifts horizontally from frame to frame
#[derive(Debug, Clone)]
pub struct SyntheticFrameSource {
    resolution: Resolution,
    frame_number: u64,
    frame_interval_us: u64,
}

impl SyntheticFrameSource {
    /// Source producing frames of the given size at a nominal 30 fps
    pub fn new(resolution: Resolution) -> Self {
        Self {
            resolution,
            frame_number: 0,
            frame_interval_us: 33_333,
        }
    }

    /// Frames produced so far
    pub fn frames_produced(&self) -> u64 {
        self.frame_number
    }

    /// Build the next frame
    pub fn next_frame(&mut self) -> RawFrame {
        let Resolution { width, height } = self.resolution;
        let (w, h) = (width as usize, height as usize);
        let mut data = vec![0u8; w * h * 4];

        let panel_w = (w / 3).max(1);
        let travel = w.saturating_sub(panel_w).max(1);
        let offset = (self.frame_number as usize * 4) % (2 * travel);
        let left = if offset < travel { offset } else { 2 * travel - offset };
        let top = h / 4;
        let bottom = h - h / 4;

        for y in 0..h {
            for x in 0..w {
                let i = (y * w + x) * 4;
                let inside = x >= left && x < left + panel_w && y >= top && y < bottom;
                let value = if inside {
                    230
                } else {
                    // faint vertical gradient so the background is not flat
                    (16 + (y * 32) / h.max(1)) as u8
                };
                data[i] = value;
                data[i + 1] = value;
                data[i + 2] = value;
                data[i + 3] = 255;
            }
        }

        let frame = RawFrame::new(Bytes::from(data), width, height, PixelFormat::Rgba32)
            .with_frame_number(self.frame_number)
            .with_timestamp_us(self.frame_number * self.frame_interval_us);
        self.frame_number += 1;
        frame
    }
}

impl FrameSource for SyntheticFrameSource {
    fn try_acquire_frame(&mut self) -> Option<RawFrame> {
        Some(self.next_frame())
    }
}

/// Primary source with a switch-over to synthetic frames
pub struct FallbackFrameSource<S> {
    primary: S,
    synthetic: SyntheticFrameSource,
    threshold: u32,
    consecutive_misses: u32,
    using_synthetic: bool,
}

impl<S: FrameSource> FallbackFrameSource<S> {
    /// Wrap `primary`; after `threshold` consecutive empty polls, frames come
    /// from a synthetic source of `resolution`
    pub fn new(primary: S, resolution: Resolution, threshold: u32) -> Self {
        Self {
            primary,
            synthetic: SyntheticFrameSource::new(resolution),
            threshold: threshold.max(1),
            consecutive_misses: 0,
            using_synthetic: false,
        }
    }

    /// Whether the synthetic source has taken over
    pub fn is_using_synthetic(&self) -> bool {
        self.using_synthetic
    }
}

impl<S: FrameSource> FrameSource for FallbackFrameSource<S> {
    fn try_acquire_frame(&mut self) -> Option<RawFrame> {
        if self.using_synthetic {
            return self.synthetic.try_acquire_frame();
        }
        match self.primary.try_acquire_frame() {
            Some(frame) => {
                self.consecutive_misses = 0;
                Some(frame)
            }
            None => {
                self.consecutive_misses += 1;
                if self.consecutive_misses >= self.threshold {
                    tracing::warn!(
                        "No frame from primary source after {} attempts, switching to synthetic frames",
                        self.consecutive_misses
                    );
                    self.using_synthetic = true;
                }
                None
            }
        }
    }
}
