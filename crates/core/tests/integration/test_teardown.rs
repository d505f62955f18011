//! Scheduler teardown
//!
//! Shutdown must cancel an in-flight run, wait for it to unwind and leave the
//! pool with zero buffers in use.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Notify;
use wallseg_core::config::BlendMode;
use wallseg_core::converter::FrameConverter;
use wallseg_core::inference::SimulatedEngine;
use wallseg_core::tensor::TensorShape;
use wallseg_core::{
    FrameScheduler, ImageBuffer, PixelFormat, RawFrame, Resolution, SchedulerState,
    SegmentationConfig, TriggerOutcome,
};

fn config() -> SegmentationConfig {
    SegmentationConfig::default()
        .with_display_resolution(Resolution::new(64, 48))
        .with_resolution_bounds(
            Resolution::new(8, 6),
            Resolution::new(64, 48),
            Resolution::new(8, 6),
        )
        .with_input_resolution(Resolution::new(32, 24))
        .with_max_invocations_per_second(0.0)
}

fn frame() -> RawFrame {
    RawFrame::new(vec![0u8; 32 * 24 * 4], 32, 24, PixelFormat::Rgba32)
}

fn engine() -> Box<SimulatedEngine> {
    Box::new(SimulatedEngine::constant(TensorShape::new(1, 1, 8, 8), 1.0))
}

/// Converter that never finishes once entered
struct StalledConverter {
    entered: Arc<Notify>,
}

#[async_trait]
impl FrameConverter for StalledConverter {
    fn name(&self) -> &str {
        "stalled"
    }

    fn supports(&self, _format: PixelFormat) -> bool {
        true
    }

    async fn convert(&self, _frame: &RawFrame, _output: &mut ImageBuffer) -> wallseg_core::Result<()> {
        self.entered.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_run() -> anyhow::Result<()> {
    let entered = Arc::new(Notify::new());
    let scheduler = FrameScheduler::builder(config())
        .with_engine(engine())
        .with_converter(Box::new(StalledConverter {
            entered: Arc::clone(&entered),
        }))
        .build()?;
    let mut masks = scheduler.subscribe()?;

    assert!(scheduler.trigger(frame()).is_started());
    entered.notified().await;
    // low-res mask, display mask and the run's converted input
    assert_eq!(scheduler.pool().in_use_count(), 3);
    assert_eq!(scheduler.state(), SchedulerState::Running);

    let report = scheduler.shutdown().await;
    assert!(report.aborted_run);
    assert_eq!(report.leaked_buffers, 0);
    assert_eq!(report.pool.in_use_buffers, 0);
    assert_eq!(report.pool.available_buffers, 0);
    assert_eq!(scheduler.pool().in_use_count(), 0);

    assert!(masks.recv().await.is_none());
    assert_eq!(scheduler.state(), SchedulerState::ShutDown);
    assert_eq!(scheduler.trigger(frame()), TriggerOutcome::ShutDown);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_after_runs_releases_everything() -> anyhow::Result<()> {
    let config = config().with_temporal_blend(0.6, BlendMode::Linear);
    let scheduler = FrameScheduler::new(config, engine())?;

    for _ in 0..5 {
        assert!(scheduler.trigger(frame()).is_started());
        scheduler.wait_idle().await;
    }
    // low-res, display and the retained previous mask
    assert_eq!(scheduler.pool().in_use_count(), 3);

    let report = scheduler.shutdown().await;
    assert!(!report.aborted_run);
    assert_eq!(report.leaked_buffers, 0);
    assert_eq!(report.pool.in_use_buffers, 0);
    assert_eq!(report.pool.total_created, report.pool.total_destroyed);
    Ok(())
}

#[tokio::test]
async fn test_buffers_held_outside_are_reported() -> anyhow::Result<()> {
    let scheduler = FrameScheduler::new(config(), engine())?;
    let held = scheduler
        .pool()
        .acquire(Resolution::new(4, 4), PixelFormat::RFloat)?;

    let report = scheduler.shutdown().await;
    assert_eq!(report.leaked_buffers, 1);
    assert_eq!(scheduler.pool().in_use_count(), 0);

    // Late release after teardown is absorbed
    drop(held);
    assert_eq!(scheduler.pool().available_count(), 0);
    assert!(scheduler.pool().is_closed());
    Ok(())
}

#[tokio::test]
async fn test_shutdown_is_idempotent() -> anyhow::Result<()> {
    let scheduler = FrameScheduler::new(config(), engine())?;
    let first = scheduler.shutdown().await;
    let second = scheduler.shutdown().await;
    assert_eq!(first.leaked_buffers, 0);
    assert_eq!(second.leaked_buffers, 0);
    assert_eq!(second.observers_closed, 0);
    Ok(())
}
