//! Closed-loop working resolution control
//!
//! Each completed run reports its total latency. The controller keeps the
//! last K samples for reporting and counts consecutive samples on either side
//! of a dead band around the budget:
//!
//! - above `budget * 1.0` for `samples_to_step_down` samples: step down
//! - below `budget * 0.67` for `samples_to_step_up` samples: step up
//!
//! A sample inside the dead band resets both counters. Counters also reset on
//! every change, and changes are at least `adjustment_cooldown` apart.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::QualityConfig;
use crate::data::Resolution;

/// Over-budget ratio of the latency budget
pub const OVER_BUDGET_RATIO: f32 = 1.0;

/// Well-under-budget ratio of the latency budget
pub const UNDER_BUDGET_RATIO: f32 = 0.67;

/// Direction of a resolution change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Lower resolution, cheaper runs
    Down,
    /// Higher resolution, better masks
    Up,
}

/// A change applied by the controller
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolutionChange {
    /// Resolution before the change
    pub from: Resolution,
    /// Resolution after the change
    pub to: Resolution,
    /// Direction of the change
    pub direction: Direction,
    /// Rolling average latency when the change was made
    pub average_latency_ms: f32,
}

/// Consecutive-sample counter with a trigger threshold
#[derive(Debug, Clone)]
struct StreakCounter {
    consecutive_count: u32,
    samples_to_trigger: u32,
}

impl StreakCounter {
    fn new(samples_to_trigger: u32) -> Self {
        Self {
            consecutive_count: 0,
            samples_to_trigger,
        }
    }

    /// Count a sample, returns true once the streak is long enough
    fn update(&mut self, condition_met: bool) -> bool {
        if condition_met {
            self.consecutive_count = self.consecutive_count.saturating_add(1);
        } else {
            self.consecutive_count = 0;
        }
        self.consecutive_count >= self.samples_to_trigger
    }

    fn reset(&mut self) {
        self.consecutive_count = 0;
    }
}

/// Working resolution controller
#[derive(Debug)]
pub struct QualityController {
    config: QualityConfig,
    resolution: Resolution,
    samples: VecDeque<f32>,
    over: StreakCounter,
    under: StreakCounter,
    last_adjustment: Option<Instant>,
    adaptive: bool,
    changes: u64,
}

impl QualityController {
    /// Create a controller starting at the configured input resolution
    pub fn new(config: QualityConfig) -> Self {
        Self {
            resolution: config.input_resolution,
            samples: VecDeque::with_capacity(config.latency_window),
            over: StreakCounter::new(config.samples_to_step_down),
            under: StreakCounter::new(config.samples_to_step_up),
            last_adjustment: None,
            adaptive: config.adaptive,
            changes: 0,
            config,
        }
    }

    /// Current working resolution
    pub fn current_resolution(&self) -> Resolution {
        self.resolution
    }

    /// Mean of the rolling latency window, 0 when empty
    pub fn average_latency_ms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f32>() / self.samples.len() as f32
    }

    /// Number of changes applied so far
    pub fn change_count(&self) -> u64 {
        self.changes
    }

    /// Whether the controller is adapting
    pub fn is_adaptive(&self) -> bool {
        self.adaptive
    }

    /// Turn adaptation on or off
    ///
    /// Turning it off returns to the configured input resolution.
    pub fn set_adaptive(&mut self, adaptive: bool) {
        self.adaptive = adaptive;
        self.over.reset();
        self.under.reset();
        if !adaptive {
            self.resolution = self.config.input_resolution;
        }
        tracing::info!(
            "Adaptive resolution {} at {}",
            if adaptive { "enabled" } else { "disabled" },
            self.resolution
        );
    }

    /// Pin the working resolution and stop adapting
    ///
    /// The value is clamped to the configured bounds; the applied resolution
    /// is returned.
    pub fn set_fixed_resolution(&mut self, resolution: Resolution) -> Resolution {
        self.adaptive = false;
        self.over.reset();
        self.under.reset();
        self.resolution = resolution.clamp(self.config.min_resolution, self.config.max_resolution);
        tracing::info!("Working resolution fixed at {}", self.resolution);
        self.resolution
    }

    /// Feed one run's total latency
    pub fn observe(&mut self, latency: Duration, now: Instant) -> Option<ResolutionChange> {
        let ms = latency.as_micros() as f32 / 1000.0;
        if self.samples.len() == self.config.latency_window {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);

        if !self.adaptive {
            return None;
        }

        let budget = self.config.target_latency_budget_ms;
        let over = self.over.update(ms > budget * OVER_BUDGET_RATIO);
        let under = self.under.update(ms < budget * UNDER_BUDGET_RATIO);

        if let Some(last) = self.last_adjustment {
            if now.saturating_duration_since(last) < self.config.adjustment_cooldown() {
                return None;
            }
        }

        let (target, direction) = if over && self.can_step_down() {
            (self.step_down(), Direction::Down)
        } else if under && self.can_step_up() {
            (self.step_up(), Direction::Up)
        } else {
            return None;
        };

        let change = ResolutionChange {
            from: self.resolution,
            to: target,
            direction,
            average_latency_ms: self.average_latency_ms(),
        };
        self.resolution = target;
        self.over.reset();
        self.under.reset();
        self.last_adjustment = Some(now);
        self.changes += 1;

        tracing::info!(
            "Working resolution {:?} {} -> {} (avg latency {:.1} ms, budget {:.1} ms)",
            direction,
            change.from,
            change.to,
            change.average_latency_ms,
            budget
        );
        Some(change)
    }

    fn can_step_down(&self) -> bool {
        let min = self.config.min_resolution;
        self.resolution.width > min.width || self.resolution.height > min.height
    }

    fn can_step_up(&self) -> bool {
        let max = self.config.max_resolution;
        self.resolution.width < max.width || self.resolution.height < max.height
    }

    fn step_down(&self) -> Resolution {
        let step = self.config.resolution_step;
        Resolution::new(
            self.resolution.width.saturating_sub(step.width),
            self.resolution.height.saturating_sub(step.height),
        )
        .clamp(self.config.min_resolution, self.config.max_resolution)
    }

    fn step_up(&self) -> Resolution {
        let step = self.config.resolution_step;
        Resolution::new(
            self.resolution.width.saturating_add(step.width),
            self.resolution.height.saturating_add(step.height),
        )
        .clamp(self.config.min_resolution, self.config.max_resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> QualityController {
        QualityController::new(QualityConfig {
            adjustment_cooldown_ms: 1_000,
            ..QualityConfig::default()
        })
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[tokio::test(start_paused = true)]
    async fn test_steps_down_after_consecutive_over_budget() {
        let mut q = controller();
        let now = Instant::now();
        assert!(q.observe(ms(80), now).is_none());
        assert!(q.observe(ms(80), now).is_none());
        let change = q.observe(ms(80), now).unwrap();
        assert_eq!(change.direction, Direction::Down);
        assert_eq!(change.to, Resolution::new(576, 432));
        assert_eq!(q.current_resolution(), Resolution::new(576, 432));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_boundaries_are_exclusive() {
        let mut q = controller();
        let now = Instant::now();
        // Exactly on budget is not over it
        for _ in 0..10 {
            assert!(q.observe(ms(50), now).is_none());
        }
        // 33.5 ms is the step-up line; 34 ms sits in the dead band
        for _ in 0..10 {
            assert!(q.observe(ms(34), now).is_none());
        }
        assert_eq!(q.current_resolution(), Resolution::new(640, 480));

        q.observe(ms(51), now);
        q.observe(ms(51), now);
        assert_eq!(q.observe(ms(51), now).unwrap().direction, Direction::Down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_band_resets_streak() {
        let mut q = controller();
        let now = Instant::now();
        q.observe(ms(80), now);
        q.observe(ms(80), now);
        q.observe(ms(45), now);
        q.observe(ms(80), now);
        assert!(q.observe(ms(80), now).is_none());
        assert_eq!(q.current_resolution(), Resolution::new(640, 480));
    }

    #[tokio::test(start_paused = true)]
    async fn test_steps_up_when_well_under_budget() {
        let mut q = controller();
        let now = Instant::now();
        for _ in 0..4 {
            assert!(q.observe(ms(10), now).is_none());
        }
        let change = q.observe(ms(10), now).unwrap();
        assert_eq!(change.direction, Direction::Up);
        assert_eq!(change.to, Resolution::new(704, 528));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_second_change() {
        let mut q = controller();
        let start = Instant::now();
        for _ in 0..3 {
            q.observe(ms(90), start);
        }
        assert_eq!(q.change_count(), 1);
        for _ in 0..10 {
            assert!(q.observe(ms(90), start + ms(500)).is_none());
        }
        assert!(q.observe(ms(90), start + ms(1_000)).is_some());
        assert_eq!(q.change_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clamps_at_minimum() {
        let mut q = QualityController::new(QualityConfig {
            adjustment_cooldown_ms: 0,
            samples_to_step_down: 1,
            ..QualityConfig::default()
        });
        let now = Instant::now();
        for _ in 0..20 {
            q.observe(ms(200), now);
        }
        assert_eq!(q.current_resolution(), Resolution::new(384, 384));
        assert!(q.observe(ms(200), now).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_average_uses_window() {
        let mut q = QualityController::new(QualityConfig {
            latency_window: 2,
            adaptive: false,
            ..QualityConfig::default()
        });
        let now = Instant::now();
        q.observe(ms(100), now);
        q.observe(ms(20), now);
        q.observe(ms(40), now);
        assert!((q.average_latency_ms() - 30.0).abs() < 1e-3);
        assert_eq!(q.change_count(), 0);
    }

    #[test]
    fn test_fixed_resolution_is_clamped() {
        let mut q = controller();
        let applied = q.set_fixed_resolution(Resolution::new(1920, 100));
        assert_eq!(applied, Resolution::new(768, 384));
        assert!(!q.is_adaptive());
        q.set_adaptive(false);
        assert_eq!(q.current_resolution(), Resolution::new(640, 480));
    }
}
