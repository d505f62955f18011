//! Working resolution adaptation
//!
//! Success criteria:
//! - sustained over-budget runs step the working resolution down once
//! - no more than one change per cooldown window, however noisy the latency
//! - a pinned resolution never moves

use std::time::Duration;
use tokio::time::Instant;
use wallseg_core::config::QualityConfig;
use wallseg_core::inference::InferenceEngine;
use wallseg_core::monitor::Counter;
use wallseg_core::quality::{Direction, QualityController};
use wallseg_core::tensor::{TensorBuffer, TensorShape};
use wallseg_core::{FrameScheduler, PixelFormat, RawFrame, Resolution, SegmentationConfig};

/// Engine that takes a fixed wall-clock time per inference
struct SlowEngine {
    delay: Duration,
    shape: TensorShape,
}

impl InferenceEngine for SlowEngine {
    fn model_id(&self) -> &str {
        "slow"
    }

    fn output_shape(&self) -> wallseg_core::Result<TensorShape> {
        Ok(self.shape)
    }

    fn schedule(&mut self, _input: &TensorBuffer) -> wallseg_core::Result<()> {
        std::thread::sleep(self.delay);
        Ok(())
    }

    fn read_output(&mut self) -> wallseg_core::Result<TensorBuffer> {
        Ok(TensorBuffer::filled(self.shape, 1.0))
    }
}

fn frame() -> RawFrame {
    RawFrame::new(vec![128u8; 64 * 48 * 4], 64, 48, PixelFormat::Rgba32)
}

fn config() -> SegmentationConfig {
    SegmentationConfig::default()
        .with_display_resolution(Resolution::new(64, 48))
        .with_resolution_bounds(
            Resolution::new(128, 96),
            Resolution::new(768, 576),
            Resolution::new(64, 48),
        )
        .with_input_resolution(Resolution::new(448, 336))
        .with_max_invocations_per_second(0.0)
        .with_adjustment_cooldown(Duration::from_secs(60))
        .with_mask_queue_depth(16)
}

#[tokio::test]
async fn test_over_budget_runs_step_down_once_per_cooldown() -> anyhow::Result<()> {
    let engine = SlowEngine {
        delay: Duration::from_millis(70),
        shape: TensorShape::new(1, 1, 8, 8),
    };
    let scheduler = FrameScheduler::new(config(), Box::new(engine))?;
    let mut masks = scheduler.subscribe()?;

    for _ in 0..3 {
        assert!(scheduler.trigger(frame()).is_started());
        scheduler.wait_idle().await;
    }
    // one 64x48 step below 448x336
    assert_eq!(scheduler.current_resolution(), Resolution::new(384, 288));
    assert!(scheduler.average_latency_ms() > 50.0);

    for _ in 0..6 {
        assert!(scheduler.trigger(frame()).is_started());
        scheduler.wait_idle().await;
    }
    assert_eq!(
        scheduler.performance_snapshot().counter(Counter::ResolutionChanges),
        1
    );

    let working: Vec<Resolution> = masks.drain().iter().map(|u| u.working_resolution).collect();
    assert_eq!(working.len(), 9);
    assert!(working[..3].iter().all(|r| *r == Resolution::new(448, 336)));
    assert!(working[3..].iter().all(|r| *r == scheduler.current_resolution()));
    Ok(())
}

#[tokio::test]
async fn test_pinned_resolution_never_moves() -> anyhow::Result<()> {
    let engine = SlowEngine {
        delay: Duration::from_millis(60),
        shape: TensorShape::new(1, 1, 8, 8),
    };
    let scheduler = FrameScheduler::new(config(), Box::new(engine))?;
    let pinned = scheduler.set_fixed_resolution(Resolution::new(512, 384));

    for _ in 0..4 {
        assert!(scheduler.trigger(frame()).is_started());
        scheduler.wait_idle().await;
    }
    assert_eq!(scheduler.current_resolution(), pinned);
    assert_eq!(
        scheduler.performance_snapshot().counter(Counter::ResolutionChanges),
        0
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_noisy_latency_changes_at_most_once_per_cooldown() {
    let cooldown = Duration::from_secs(2);
    let mut controller = QualityController::new(QualityConfig {
        adjustment_cooldown_ms: cooldown.as_millis() as u64,
        ..QualityConfig::default()
    });

    // Bursts of 3 over-budget then 5 well-under samples, 10 ms apart
    let start = Instant::now();
    let mut changes = Vec::new();
    for i in 0..2_000u64 {
        let latency = if i % 8 < 3 { 80 } else { 10 };
        let now = start + Duration::from_millis(i * 10);
        if let Some(change) = controller.observe(Duration::from_millis(latency), now) {
            changes.push((now, change));
        }
    }

    assert!(!changes.is_empty());
    for pair in changes.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= cooldown);
    }
    // 20 s of samples cannot hold more than 10 cooldown windows
    assert!(changes.len() <= 10);
    assert_eq!(controller.change_count() as usize, changes.len());
}

#[tokio::test(start_paused = true)]
async fn test_dead_band_holds_resolution() {
    let mut controller = QualityController::new(QualityConfig {
        adjustment_cooldown_ms: 0,
        ..QualityConfig::default()
    });
    let start = Instant::now();
    // Alternating just-over and mid-band samples never builds a streak
    for i in 0..500u64 {
        let latency = if i % 2 == 0 { 55 } else { 40 };
        let now = start + Duration::from_millis(i * 10);
        assert!(controller
            .observe(Duration::from_millis(latency), now)
            .is_none());
    }
    assert_eq!(controller.current_resolution(), Resolution::new(640, 480));

    // A sustained overload still gets through
    let later = start + Duration::from_secs(10);
    let change = (0..3)
        .filter_map(|_| controller.observe(Duration::from_millis(90), later))
        .last()
        .expect("three over-budget samples step down");
    assert_eq!(change.direction, Direction::Down);
}
