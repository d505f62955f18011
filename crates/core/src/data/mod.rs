//! Data structures flowing through the segmentation pipeline
//!
//! This module contains the per-run data types:
//! - RawFrame: producer-owned camera image, read-only for one run
//! - ImageBuffer: pooled pixel buffer at a (width, height, format) key
//! - PixelFormat / Resolution / FilterMode: shared vocabulary for both

pub mod frame;
pub mod image;
pub mod video;

pub use frame::RawFrame;
pub use image::{BufferId, ImageBuffer};
pub use video::{FilterMode, PixelFormat, Resolution};
