//! Wallseg Core - adaptive real-time segmentation pipeline
//!
//! Turns a stream of camera frames into a display-resolution segmentation
//! mask under a per-frame latency budget.
//!
//! # Architecture
//!
//! - [`FrameScheduler`] admits triggers into single-flight, rate-limited runs
//! - [`converter`] turns raw frames into RGBA images at the working resolution
//! - [`inference`] wraps the segmentation model behind a schedule/read-back engine
//! - [`reconstruct`] renders, denoises, upscales and optionally blends the mask
//! - [`quality`] adapts the working resolution to observed latency
//! - [`pool`] recycles image buffers and watches for leaks
//! - [`monitor`] keeps per-stage latency histograms and counters
//!
//! # Example
//!
//! ```no_run
//! use wallseg_core::inference::SimulatedEngine;
//! use wallseg_core::source::SyntheticFrameSource;
//! use wallseg_core::tensor::TensorShape;
//! use wallseg_core::{FrameScheduler, SegmentationConfig};
//!
//! #[tokio::main]
//! async fn main() -> wallseg_core::Result<()> {
//!     let config = SegmentationConfig::default();
//!     let engine = SimulatedEngine::luma(TensorShape::new(1, 1, 120, 160));
//!     let scheduler = FrameScheduler::new(config, Box::new(engine))?;
//!     let mut masks = scheduler.subscribe()?;
//!
//!     let mut camera = SyntheticFrameSource::new(scheduler.config().display_resolution);
//!     scheduler.tick(&mut camera);
//!     if let Some(update) = masks.recv().await {
//!         println!("mask {} covers {:.1}%", update.run_id, update.coverage * 100.0);
//!     }
//!
//!     scheduler.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod converter;
pub mod data;
pub mod inference;
pub mod monitor;
pub mod pool;
pub mod quality;
pub mod reconstruct;
pub mod scheduler;
pub mod source;
pub mod tensor;

mod error;
pub use error::{Error, Result};

pub use config::SegmentationConfig;
pub use data::{ImageBuffer, PixelFormat, RawFrame, Resolution};
pub use monitor::{PerformanceMonitor, PerformanceSnapshot};
pub use pool::{PoolMetrics, ResourcePool};
pub use quality::QualityController;
pub use reconstruct::{Degradation, MaskReconstructor};
pub use scheduler::{
    FrameScheduler, MaskSubscription, MaskUpdate, SchedulerBuilder, SchedulerState,
    ShutdownReport, TriggerOutcome,
};
pub use source::FrameSource;

/// Initialize logging
///
/// Installs a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
/// Call once at startup.
pub fn init() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| Error::InvalidConfig(format!("logging already initialized: {}", e)))?;

    tracing::info!("Wallseg core initialized");
    Ok(())
}
