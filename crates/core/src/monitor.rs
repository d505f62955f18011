//! Pipeline performance metrics
//!
//! Per-stage latency histograms (HDR, microseconds) and run counters, with a
//! periodic summary log and Prometheus text export.

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::MonitorConfig;
use crate::data::Resolution;
use crate::pool::PoolMetrics;
use crate::{Error, Result};

/// Histogram upper bound: 60 seconds in microseconds
const MAX_TRACKABLE_US: u64 = 60_000_000;

/// Timed pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Conversion,
    Inference,
    Render,
    Denoise,
    Upscale,
    Blend,
    /// Whole run, trigger to publish
    Total,
}

impl Stage {
    /// All stages in pipeline order
    pub const ALL: [Stage; 7] = [
        Stage::Conversion,
        Stage::Inference,
        Stage::Render,
        Stage::Denoise,
        Stage::Upscale,
        Stage::Blend,
        Stage::Total,
    ];

    /// Label used in logs and exports
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Conversion => "conversion",
            Stage::Inference => "inference",
            Stage::Render => "render",
            Stage::Denoise => "denoise",
            Stage::Upscale => "upscale",
            Stage::Blend => "blend",
            Stage::Total => "total",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Monotonic pipeline counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    RunsStarted,
    RunsSucceeded,
    RunsFailed,
    ConversionFailures,
    InferenceFailures,
    ReconstructionFailures,
    /// Trigger arrived while a run was in flight
    DroppedBusy,
    /// Trigger arrived before the minimum interval elapsed
    DroppedRateLimited,
    /// Frame source had nothing to offer
    FramesUnavailable,
    MasksPublished,
    DegradedMasks,
    ResolutionChanges,
}

impl Counter {
    /// Number of counters
    pub const COUNT: usize = 12;

    /// All counters
    pub const ALL: [Counter; Counter::COUNT] = [
        Counter::RunsStarted,
        Counter::RunsSucceeded,
        Counter::RunsFailed,
        Counter::ConversionFailures,
        Counter::InferenceFailures,
        Counter::ReconstructionFailures,
        Counter::DroppedBusy,
        Counter::DroppedRateLimited,
        Counter::FramesUnavailable,
        Counter::MasksPublished,
        Counter::DegradedMasks,
        Counter::ResolutionChanges,
    ];

    /// Label used in logs and exports
    pub fn as_str(&self) -> &'static str {
        match self {
            Counter::RunsStarted => "runs_started",
            Counter::RunsSucceeded => "runs_succeeded",
            Counter::RunsFailed => "runs_failed",
            Counter::ConversionFailures => "conversion_failures",
            Counter::InferenceFailures => "inference_failures",
            Counter::ReconstructionFailures => "reconstruction_failures",
            Counter::DroppedBusy => "dropped_busy",
            Counter::DroppedRateLimited => "dropped_rate_limited",
            Counter::FramesUnavailable => "frames_unavailable",
            Counter::MasksPublished => "masks_published",
            Counter::DegradedMasks => "degraded_masks",
            Counter::ResolutionChanges => "resolution_changes",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Latency summary of one stage, in milliseconds
#[derive(Debug, Clone, Serialize)]
pub struct StageStats {
    pub stage: Stage,
    pub count: u64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Point-in-time view of the monitor
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSnapshot {
    pub uptime_secs: f64,
    pub counters: Vec<(Counter, u64)>,
    pub stages: Vec<StageStats>,
    /// Fraction of the last published mask above the coverage threshold
    pub last_coverage: Option<f32>,
}

impl PerformanceSnapshot {
    /// Value of one counter
    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters
            .iter()
            .find(|(c, _)| *c == counter)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    /// Stats of one stage
    pub fn stage(&self, stage: Stage) -> Option<&StageStats> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// Runs per second since the monitor started
    pub fn processing_rate(&self) -> f64 {
        if self.uptime_secs <= 0.0 {
            return 0.0;
        }
        self.counter(Counter::RunsSucceeded) as f64 / self.uptime_secs
    }
}

/// Pipeline metrics sink
pub struct PerformanceMonitor {
    config: MonitorConfig,
    histograms: Mutex<Vec<Histogram<u64>>>,
    counters: [AtomicU64; Counter::COUNT],
    last_coverage: Mutex<Option<f32>>,
    started_at: Instant,
    last_log: Mutex<Instant>,
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("runs_succeeded", &self.count(Counter::RunsSucceeded))
            .field("runs_failed", &self.count(Counter::RunsFailed))
            .finish()
    }
}

impl PerformanceMonitor {
    /// Create a monitor with empty histograms
    pub fn new(config: MonitorConfig) -> Result<Self> {
        let histograms = Stage::ALL
            .iter()
            .map(|stage| {
                Histogram::<u64>::new_with_max(MAX_TRACKABLE_US, 3).map_err(|e| {
                    Error::InvalidConfig(format!(
                        "Failed to create {} histogram: {}",
                        stage.as_str(),
                        e
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let now = Instant::now();

        Ok(Self {
            config,
            histograms: Mutex::new(histograms),
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            last_coverage: Mutex::new(None),
            started_at: now,
            last_log: Mutex::new(now),
        })
    }

    /// Record a stage duration
    pub fn record_stage(&self, stage: Stage, elapsed: Duration) {
        let us = (elapsed.as_micros() as u64).clamp(1, MAX_TRACKABLE_US);
        self.histograms.lock()[stage.index()].saturating_record(us);
    }

    /// Increment a counter
    pub fn increment(&self, counter: Counter) {
        self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of a counter
    pub fn count(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Remember the coverage of the last published mask
    pub fn set_coverage(&self, coverage: f32) {
        *self.last_coverage.lock() = Some(coverage);
    }

    /// Mean latency of a stage in milliseconds, 0 when unrecorded
    pub fn mean_ms(&self, stage: Stage) -> f64 {
        let histograms = self.histograms.lock();
        let h = &histograms[stage.index()];
        if h.is_empty() {
            0.0
        } else {
            h.mean() / 1000.0
        }
    }

    /// Snapshot of all counters and stage statistics
    pub fn snapshot(&self) -> PerformanceSnapshot {
        let stages = {
            let histograms = self.histograms.lock();
            Stage::ALL
                .iter()
                .map(|stage| stage_stats(*stage, &histograms[stage.index()]))
                .collect()
        };
        PerformanceSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
            counters: Counter::ALL.iter().map(|c| (*c, self.count(*c))).collect(),
            stages,
            last_coverage: *self.last_coverage.lock(),
        }
    }

    /// Log a summary when the log interval has elapsed
    ///
    /// Returns true if a summary was written.
    pub fn maybe_log(&self, now: Instant, resolution: Resolution, pool: &PoolMetrics) -> bool {
        if !self.config.enable_periodic_log {
            return false;
        }
        {
            let mut last = self.last_log.lock();
            if now.saturating_duration_since(*last) < self.config.performance_log_interval() {
                return false;
            }
            *last = now;
        }

        let snapshot = self.snapshot();
        let total = snapshot.stage(Stage::Total);
        tracing::info!(
            "Segmentation: {} ok / {} failed, {:.2} runs/s, avg {:.1} ms, p95 {:.1} ms, working {}, dropped {} busy / {} rate, coverage {}",
            snapshot.counter(Counter::RunsSucceeded),
            snapshot.counter(Counter::RunsFailed),
            snapshot.processing_rate(),
            total.map(|s| s.mean_ms).unwrap_or(0.0),
            total.map(|s| s.p95_ms).unwrap_or(0.0),
            resolution,
            snapshot.counter(Counter::DroppedBusy),
            snapshot.counter(Counter::DroppedRateLimited),
            snapshot
                .last_coverage
                .map(|c| format!("{:.1}%", c * 100.0))
                .unwrap_or_else(|| "n/a".to_string()),
        );
        tracing::debug!(
            "Pool: {} in use, {} available, {:.1} MB, {} created / {} reused",
            pool.in_use_buffers,
            pool.available_buffers,
            pool.total_bytes() as f64 / (1024.0 * 1024.0),
            pool.total_created,
            pool.total_reused
        );
        true
    }

    /// Export counters and stage percentiles in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        for counter in Counter::ALL {
            output.push_str(&format!(
                "segmentation_{}_total {}\n",
                counter.as_str(),
                self.count(counter)
            ));
        }

        let histograms = self.histograms.lock();
        for stage in Stage::ALL {
            let h = &histograms[stage.index()];
            output.push_str(&format!(
                "segmentation_stage_samples_total{{stage=\"{}\"}} {}\n",
                stage.as_str(),
                h.len()
            ));
            for (label, q) in [("p50", 0.50), ("p95", 0.95), ("p99", 0.99)] {
                output.push_str(&format!(
                    "segmentation_stage_latency_{}_us{{stage=\"{}\"}} {}\n",
                    label,
                    stage.as_str(),
                    h.value_at_quantile(q)
                ));
            }
        }
        drop(histograms);

        if let Some(coverage) = *self.last_coverage.lock() {
            output.push_str(&format!("segmentation_mask_coverage {}\n", coverage));
        }
        output
    }
}

fn stage_stats(stage: Stage, h: &Histogram<u64>) -> StageStats {
    let ms = |us: u64| us as f64 / 1000.0;
    StageStats {
        stage,
        count: h.len(),
        mean_ms: if h.is_empty() { 0.0 } else { h.mean() / 1000.0 },
        p50_ms: ms(h.value_at_quantile(0.50)),
        p95_ms: ms(h.value_at_quantile(0.95)),
        p99_ms: ms(h.value_at_quantile(0.99)),
        max_ms: ms(h.max()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::new(MonitorConfig::default()).unwrap()
    }

    #[test]
    fn test_counters() {
        let m = monitor();
        m.increment(Counter::RunsStarted);
        m.increment(Counter::RunsStarted);
        m.increment(Counter::DroppedBusy);
        assert_eq!(m.count(Counter::RunsStarted), 2);
        assert_eq!(m.snapshot().counter(Counter::DroppedBusy), 1);
        assert_eq!(m.snapshot().counter(Counter::RunsFailed), 0);
    }

    #[test]
    fn test_stage_percentiles() {
        let m = monitor();
        for ms in 1..=100u64 {
            m.record_stage(Stage::Inference, Duration::from_millis(ms));
        }
        let snapshot = m.snapshot();
        let stats = snapshot.stage(Stage::Inference).unwrap();
        assert_eq!(stats.count, 100);
        assert!((stats.p50_ms - 50.0).abs() < 1.0);
        assert!(stats.p99_ms >= 98.0);
        assert!((m.mean_ms(Stage::Inference) - 50.5).abs() < 0.5);
        assert_eq!(snapshot.stage(Stage::Blend).unwrap().count, 0);
    }

    #[test]
    fn test_out_of_range_sample_is_clamped() {
        let m = monitor();
        m.record_stage(Stage::Total, Duration::from_secs(3600));
        m.record_stage(Stage::Total, Duration::ZERO);
        assert_eq!(m.snapshot().stage(Stage::Total).unwrap().count, 2);
    }

    #[test]
    fn test_prometheus_export() {
        let m = monitor();
        m.increment(Counter::MasksPublished);
        m.record_stage(Stage::Total, Duration::from_millis(12));
        m.set_coverage(0.25);
        let prom = m.to_prometheus();
        assert!(prom.contains("segmentation_masks_published_total 1\n"));
        assert!(prom.contains("segmentation_stage_latency_p95_us{stage=\"total\"}"));
        assert!(prom.contains("segmentation_mask_coverage 0.25"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_log_respects_interval() {
        let m = monitor();
        let pool = PoolMetrics::default();
        let res = Resolution::new(640, 480);
        let start = Instant::now();
        assert!(!m.maybe_log(start + Duration::from_secs(1), res, &pool));
        assert!(m.maybe_log(start + Duration::from_secs(5), res, &pool));
        assert!(!m.maybe_log(start + Duration::from_secs(6), res, &pool));
        assert!(m.maybe_log(start + Duration::from_secs(10), res, &pool));
    }
}
