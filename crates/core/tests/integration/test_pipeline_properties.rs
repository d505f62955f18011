//! End-to-end scheduler properties
//!
//! Drives a full scheduler (CPU converter, simulated engine, default
//! reconstruction) and checks the run-level guarantees:
//! 1. A uniform inference result yields a uniform display mask
//! 2. Accepted runs respect the rate limit
//! 3. Runs never overlap
//! 4. Steady-state runs allocate no new buffers
//! 5. Missing optional stages degrade the mask without changing its size
//! 6. Failed runs publish nothing and leave the scheduler idle

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wallseg_core::config::BlendMode;
use wallseg_core::converter::{CpuFrameConverter, FrameConverter};
use wallseg_core::inference::{InferenceEngine, SimulatedEngine};
use wallseg_core::monitor::Counter;
use wallseg_core::tensor::{TensorBuffer, TensorShape};
use wallseg_core::{
    Degradation, Error, FrameScheduler, ImageBuffer, PixelFormat, RawFrame, Resolution,
    SchedulerState, SegmentationConfig, TriggerOutcome,
};

fn small_config() -> SegmentationConfig {
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

fn frame(n: u64) -> RawFrame {
    RawFrame::new(vec![200u8; 32 * 24 * 4], 32, 24, PixelFormat::Rgba32).with_frame_number(n)
}

fn constant_engine(value: f32) -> Box<dyn InferenceEngine> {
    Box::new(SimulatedEngine::constant(TensorShape::new(1, 1, 8, 8), value))
}

/// Converter that records how many conversions are in flight at once
struct OverlapProbe {
    inner: CpuFrameConverter,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameConverter for OverlapProbe {
    fn name(&self) -> &str {
        "overlap-probe"
    }

    fn supports(&self, format: PixelFormat) -> bool {
        self.inner.supports(format)
    }

    async fn convert(&self, frame: &RawFrame, output: &mut ImageBuffer) -> wallseg_core::Result<()> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let result = self.inner.convert(frame, output).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Engine whose read-back always fails
struct BrokenEngine;

impl InferenceEngine for BrokenEngine {
    fn model_id(&self) -> &str {
        "broken"
    }

    fn output_shape(&self) -> wallseg_core::Result<TensorShape> {
        Ok(TensorShape::new(1, 1, 8, 8))
    }

    fn schedule(&mut self, _input: &TensorBuffer) -> wallseg_core::Result<()> {
        Ok(())
    }

    fn read_output(&mut self) -> wallseg_core::Result<TensorBuffer> {
        Err(Error::Inference("device lost".into()))
    }
}

#[tokio::test]
async fn test_uniform_result_fills_display() -> anyhow::Result<()> {
    let engine = SimulatedEngine::constant(TensorShape::new(1, 1, 80, 80), 1.0);
    let scheduler = FrameScheduler::new(SegmentationConfig::default(), Box::new(engine))?;
    let mut masks = scheduler.subscribe()?;

    let camera = RawFrame::new(vec![0u8; 640 * 480 * 4], 640, 480, PixelFormat::Rgba32);
    assert!(scheduler.trigger(camera).is_started());

    let update = masks.recv().await.expect("one mask per successful run");
    assert_eq!(update.mask.resolution(), Resolution::new(640, 480));
    assert!(update.mask.data().iter().all(|v| *v == 1.0));
    assert!(update.degradation.is_empty());

    scheduler.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_bounds_runs() -> anyhow::Result<()> {
    let config = small_config().with_max_invocations_per_second(15.0);
    let min_interval = config.min_run_interval().expect("rate limited");
    let scheduler = FrameScheduler::new(config, constant_engine(1.0))?;
    let mut masks = scheduler.subscribe()?;

    let start = tokio::time::Instant::now();
    let mut accepted = Vec::new();
    let mut delivered = 0;
    for n in 0..100u64 {
        if scheduler.trigger(frame(n)).is_started() {
            accepted.push(tokio::time::Instant::now());
        }
        scheduler.wait_idle().await;
        delivered += masks.drain().len();
        tokio::time::advance(Duration::from_micros(16_667)).await;
    }

    // ceil(100 / 60 * 15) = 25
    assert!(accepted.len() <= 25, "{} runs accepted", accepted.len());
    assert!(accepted.len() >= 20, "{} runs accepted", accepted.len());
    assert_eq!(accepted[0], start);
    for pair in accepted.windows(2) {
        assert!(pair[1] - pair[0] >= min_interval);
    }

    assert_eq!(delivered, accepted.len());
    let snapshot = scheduler.performance_snapshot();
    assert_eq!(
        snapshot.counter(Counter::DroppedRateLimited),
        100 - accepted.len() as u64
    );
    assert_eq!(snapshot.counter(Counter::DroppedBusy), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_runs_never_overlap() -> anyhow::Result<()> {
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let probe = OverlapProbe {
        inner: CpuFrameConverter::default(),
        active: Arc::clone(&active),
        max_active: Arc::clone(&max_active),
    };
    let scheduler = FrameScheduler::builder(small_config())
        .with_engine(constant_engine(1.0))
        .with_converter(Box::new(probe))
        .build()?;

    let mut started = 0u32;
    let mut busy = 0u32;
    for n in 0..200u64 {
        match scheduler.trigger(frame(n)) {
            TriggerOutcome::Started { .. } => started += 1,
            TriggerOutcome::DroppedBusy => busy += 1,
            other => panic!("unexpected outcome {:?}", other),
        }
        if n % 10 == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
    scheduler.wait_idle().await;

    assert_eq!(max_active.load(Ordering::SeqCst), 1);
    assert_eq!(active.load(Ordering::SeqCst), 0);
    assert!(started >= 1);
    assert!(busy >= 1);
    assert_eq!(scheduler.state(), SchedulerState::Idle);
    Ok(())
}

#[tokio::test]
async fn test_pool_reuse_stabilizes() -> anyhow::Result<()> {
    let scheduler = FrameScheduler::new(small_config(), constant_engine(1.0))?;
    scheduler.set_adaptive_resolution(false);

    for n in 0..3 {
        assert!(scheduler.trigger(frame(n)).is_started());
        scheduler.wait_idle().await;
    }
    let warm = scheduler.pool_metrics();

    for n in 3..30 {
        assert!(scheduler.trigger(frame(n)).is_started());
        scheduler.wait_idle().await;
    }
    let steady = scheduler.pool_metrics();

    assert_eq!(steady.total_created, warm.total_created);
    assert_eq!(steady.total_bytes(), warm.total_bytes());
    assert!(steady.total_reused > warm.total_reused);
    // low-res and display masks stay on loan between runs
    assert_eq!(steady.in_use_buffers, 2);
    Ok(())
}

#[tokio::test]
async fn test_missing_capabilities_keep_display_size() -> anyhow::Result<()> {
    let config = small_config().with_temporal_blend(0.6, BlendMode::Exponential);
    let scheduler = FrameScheduler::builder(config)
        .with_engine(constant_engine(0.7))
        .with_denoiser(None)
        .with_blender(None)
        .build()?;
    let mut masks = scheduler.subscribe()?;

    assert!(scheduler.trigger(frame(0)).is_started());
    let update = masks.recv().await.expect("degraded masks are still published");

    assert_eq!(update.mask.resolution(), Resolution::new(64, 48));
    assert!(update.degradation.contains(Degradation::DENOISE_SKIPPED));
    assert!(update.degradation.contains(Degradation::TEMPORAL_SKIPPED));
    // Unsmoothed values pass straight through the upscale
    assert!(update.mask.data().iter().all(|v| (*v - 0.7).abs() < 1e-6));

    scheduler.wait_idle().await;
    assert_eq!(
        scheduler.performance_snapshot().counter(Counter::DegradedMasks),
        1
    );
    Ok(())
}

#[tokio::test]
async fn test_failed_inference_publishes_nothing() -> anyhow::Result<()> {
    let scheduler = FrameScheduler::new(small_config(), Box::new(BrokenEngine))?;
    let mut masks = scheduler.subscribe()?;

    assert!(scheduler.trigger(frame(0)).is_started());
    scheduler.wait_idle().await;

    assert!(masks.try_recv().is_none());
    assert_eq!(scheduler.state(), SchedulerState::Idle);
    assert!(scheduler.is_mask_stale());

    let snapshot = scheduler.performance_snapshot();
    assert_eq!(snapshot.counter(Counter::RunsFailed), 1);
    assert_eq!(snapshot.counter(Counter::InferenceFailures), 1);
    assert_eq!(snapshot.counter(Counter::MasksPublished), 0);

    // The converted input went back to the pool
    assert_eq!(scheduler.pool().in_use_count(), 2);
    assert!(scheduler.trigger(frame(1)).is_started());
    Ok(())
}

#[tokio::test]
async fn test_every_subscriber_sees_every_mask() -> anyhow::Result<()> {
    let config = small_config().with_mask_queue_depth(8);
    let scheduler = FrameScheduler::new(config, constant_engine(1.0))?;
    let mut first = scheduler.subscribe()?;
    let mut second = scheduler.subscribe()?;

    for n in 0..5 {
        assert!(scheduler.trigger(frame(n)).is_started());
        scheduler.wait_idle().await;
    }

    let a: Vec<u64> = first.drain().iter().map(|u| u.run_id).collect();
    let b: Vec<u64> = second.drain().iter().map(|u| u.run_id).collect();
    assert_eq!(a, vec![0, 1, 2, 3, 4]);
    assert_eq!(a, b);

    assert!(scheduler.unsubscribe(second.id()));
    assert!(scheduler.trigger(frame(5)).is_started());
    scheduler.wait_idle().await;
    assert_eq!(first.drain().len(), 1);
    assert!(second.try_recv().is_none());
    assert_eq!(scheduler.subscriber_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_stalled_subscriber_retains_bounded_masks() -> anyhow::Result<()> {
    let config = small_config().with_mask_queue_depth(4);
    let scheduler = FrameScheduler::new(config, constant_engine(1.0))?;
    let mut stalled = scheduler.subscribe()?;
    let mut reader = scheduler.subscribe()?;

    let mut read = Vec::new();
    for n in 0..30 {
        assert!(scheduler.trigger(frame(n)).is_started());
        scheduler.wait_idle().await;
        read.extend(reader.drain().iter().map(|u| u.run_id));
    }

    // A consumer that keeps up misses nothing
    assert_eq!(read, (0..30).collect::<Vec<u64>>());
    assert_eq!(reader.skipped(), 0);

    // The stalled one only finds the newest masks still queued
    let kept: Vec<u64> = stalled.drain().iter().map(|u| u.run_id).collect();
    assert_eq!(kept, vec![26, 27, 28, 29]);
    assert_eq!(stalled.skipped(), 26);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_mask_goes_stale() -> anyhow::Result<()> {
    let scheduler = FrameScheduler::new(small_config(), constant_engine(1.0))?;
    assert!(scheduler.trigger(frame(0)).is_started());
    scheduler.wait_idle().await;
    assert!(!scheduler.is_mask_stale());

    tokio::time::advance(Duration::from_millis(3_001)).await;
    assert!(scheduler.is_mask_stale());
    assert!(scheduler.mask_age().expect("a mask was published") > Duration::from_secs(3));
    Ok(())
}
