//! Frame scheduler
//!
//! Admits triggers into single-flight segmentation runs:
//!
//! - at most one run is in flight; triggers while Running are dropped
//! - accepted runs start at least `1 / max_invocations_per_second` apart
//! - a run publishes its mask to observers only when every mandatory stage
//!   succeeds, and the scheduler returns to Idle on every exit path
//!
//! Runs are spawned on the tokio runtime the scheduler was built in. The
//! quality controller observes each completed run before the scheduler goes
//! back to Idle, so the working resolution never changes mid-run.

pub mod observer;
pub mod run;

pub use observer::{MaskSubscription, MaskUpdate, COVERAGE_THRESHOLD};
pub use run::RunContext;

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::SegmentationConfig;
use crate::converter::{CpuFrameConverter, FrameConverter};
use crate::data::{RawFrame, Resolution};
use crate::inference::{self, InferenceEngine};
use crate::monitor::{Counter, PerformanceMonitor, PerformanceSnapshot};
use crate::pool::{MemoryReport, MemoryWatchdog, PoolMetrics, ResourcePool};
use crate::quality::QualityController;
use crate::reconstruct::{Denoiser, MaskReconstructor, TemporalBlender};
use crate::source::FrameSource;
use crate::tensor::TensorShape;
use crate::{Error, Result};

use observer::ObserverRegistry;

/// Scheduler lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// No run in flight
    Idle,
    /// A run is in flight
    Running,
    /// Torn down, all triggers rejected
    ShutDown,
}

/// What happened to a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A run was spawned
    Started { run_id: u64 },
    /// A run was already in flight
    DroppedBusy,
    /// The minimum interval since the last accepted run has not elapsed
    DroppedRateLimited,
    /// The frame source had no frame
    NoFrame,
    /// The scheduler was shut down
    ShutDown,
}

impl TriggerOutcome {
    /// Whether a run was spawned
    pub fn is_started(&self) -> bool {
        matches!(self, TriggerOutcome::Started { .. })
    }
}

/// Result of [`FrameScheduler::shutdown`]
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// A run was in flight and got cancelled
    pub aborted_run: bool,
    /// Pool buffers still on loan at teardown
    pub leaked_buffers: usize,
    /// Subscriptions closed
    pub observers_closed: usize,
    /// Pool counters after teardown
    pub pool: PoolMetrics,
}

pub(crate) struct PipelineStages {
    pub(crate) converter: Box<dyn FrameConverter>,
    pub(crate) engine: Box<dyn InferenceEngine>,
    pub(crate) reconstructor: MaskReconstructor,
}

#[derive(Default)]
struct Gate {
    last_start: Option<Instant>,
    active_run: Option<AbortHandle>,
    next_run_id: u64,
}

/// State shared between the scheduler handle and its run tasks
pub(crate) struct Shared {
    pub(crate) config: SegmentationConfig,
    pub(crate) pool: Arc<ResourcePool>,
    pub(crate) stages: tokio::sync::Mutex<Option<PipelineStages>>,
    pub(crate) quality: Mutex<QualityController>,
    pub(crate) monitor: PerformanceMonitor,
    pub(crate) observers: ObserverRegistry,
    pub(crate) last_mask_at: Mutex<Option<Instant>>,
    state: watch::Sender<SchedulerState>,
    gate: Mutex<Gate>,
    watchdog: Mutex<MemoryWatchdog>,
    output_shape: TensorShape,
}

/// Returns the scheduler to Idle when a run ends, however it ends
pub(crate) struct RunGuard {
    shared: Arc<Shared>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.shared.state.send_if_modified(|state| {
            if *state == SchedulerState::Running {
                *state = SchedulerState::Idle;
                true
            } else {
                false
            }
        });
    }
}

/// Builder for [`FrameScheduler`]
pub struct SchedulerBuilder {
    config: SegmentationConfig,
    engine: Option<Box<dyn InferenceEngine>>,
    converter: Option<Box<dyn FrameConverter>>,
    denoiser: Option<Option<Box<dyn Denoiser>>>,
    blender: Option<Option<Box<dyn TemporalBlender>>>,
    pool: Option<Arc<ResourcePool>>,
}

impl SchedulerBuilder {
    /// Set the inference engine (required)
    pub fn with_engine(mut self, engine: Box<dyn InferenceEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the frame converter (defaults to [`CpuFrameConverter`])
    pub fn with_converter(mut self, converter: Box<dyn FrameConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Override the denoise capability; `None` removes it
    pub fn with_denoiser(mut self, denoiser: Option<Box<dyn Denoiser>>) -> Self {
        self.denoiser = Some(denoiser);
        self
    }

    /// Override the temporal blend capability; `None` removes it
    pub fn with_blender(mut self, blender: Option<Box<dyn TemporalBlender>>) -> Self {
        self.blender = Some(blender);
        self
    }

    /// Share an existing buffer pool
    pub fn with_pool(mut self, pool: Arc<ResourcePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Validate the configuration and create the scheduler
    ///
    /// Must be called from within a tokio runtime; runs are spawned on it.
    pub fn build(self) -> Result<FrameScheduler> {
        let config = self.config;
        config.validate()?;

        let runtime = Handle::try_current().map_err(|_| {
            Error::InvalidConfig("FrameScheduler must be built inside a tokio runtime".to_string())
        })?;
        let engine = self
            .engine
            .ok_or_else(|| Error::InvalidConfig("no inference engine configured".to_string()))?;
        let converter = self
            .converter
            .unwrap_or_else(|| Box::new(CpuFrameConverter::default()));

        let output_shape =
            inference::discover_output_shape(engine.as_ref(), config.inference.fallback_output_shape);
        let pool = self.pool.unwrap_or_default();

        let mut reconstructor = MaskReconstructor::new(Arc::clone(&pool), &config, output_shape)?;
        if let Some(denoiser) = self.denoiser {
            reconstructor = reconstructor.with_denoiser(denoiser);
        }
        if let Some(blender) = self.blender {
            reconstructor = reconstructor.with_blender(blender);
        }

        let (state, _) = watch::channel(SchedulerState::Idle);
        let shared = Shared {
            pool,
            stages: tokio::sync::Mutex::new(Some(PipelineStages {
                converter,
                engine,
                reconstructor,
            })),
            quality: Mutex::new(QualityController::new(config.quality.clone())),
            monitor: PerformanceMonitor::new(config.monitor.clone())?,
            observers: ObserverRegistry::new(config.mask_queue_depth),
            last_mask_at: Mutex::new(None),
            state,
            gate: Mutex::new(Gate::default()),
            watchdog: Mutex::new(MemoryWatchdog::new(config.pool.clone())),
            output_shape,
            config,
        };

        tracing::info!(
            "Frame scheduler ready: {:.1} runs/s max, working {}, display {}, output {}",
            shared.config.max_invocations_per_second,
            shared.config.quality.input_resolution,
            shared.config.display_resolution,
            output_shape
        );

        Ok(FrameScheduler {
            shared: Arc::new(shared),
            runtime,
        })
    }
}

/// Single-flight, rate-limited segmentation scheduler
///
/// # Example
///
/// ```
/// # tokio_test::block_on(async {
/// use wallseg_core::inference::SimulatedEngine;
/// use wallseg_core::tensor::TensorShape;
/// use wallseg_core::{FrameScheduler, PixelFormat, RawFrame, SegmentationConfig};
///
/// let engine = SimulatedEngine::constant(TensorShape::new(1, 1, 80, 80), 1.0);
/// let scheduler = FrameScheduler::new(SegmentationConfig::default(), Box::new(engine)).unwrap();
/// let mut masks = scheduler.subscribe().unwrap();
///
/// let frame = RawFrame::new(vec![0u8; 640 * 480 * 4], 640, 480, PixelFormat::Rgba32);
/// assert!(scheduler.trigger(frame).is_started());
/// let update = masks.recv().await.unwrap();
/// assert!(update.mask.data().iter().all(|v| *v == 1.0));
/// scheduler.shutdown().await;
/// # });
/// ```
pub struct FrameScheduler {
    shared: Arc<Shared>,
    runtime: Handle,
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("state", &self.state())
            .field("working_resolution", &self.current_resolution())
            .finish()
    }
}

impl FrameScheduler {
    /// Start building a scheduler
    pub fn builder(config: SegmentationConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            engine: None,
            converter: None,
            denoiser: None,
            blender: None,
            pool: None,
        }
    }

    /// Scheduler with the default converter and reconstruction capabilities
    pub fn new(config: SegmentationConfig, engine: Box<dyn InferenceEngine>) -> Result<Self> {
        Self::builder(config).with_engine(engine).build()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SchedulerState {
        *self.shared.state.borrow()
    }

    /// Offer a frame; spawns a run if the scheduler is Idle and the rate
    /// limit allows it
    pub fn trigger(&self, frame: RawFrame) -> TriggerOutcome {
        let now = Instant::now();
        self.housekeeping(now);

        let mut gate = self.shared.gate.lock();
        if let Some(outcome) = self.admission(&gate, now) {
            return outcome;
        }

        let run_id = gate.next_run_id;
        gate.next_run_id += 1;
        gate.last_start = Some(now);
        self.shared.state.send_replace(SchedulerState::Running);

        let working = self.shared.quality.lock().current_resolution();
        let ctx = RunContext::new(run_id, frame, working, now);
        let guard = RunGuard {
            shared: Arc::clone(&self.shared),
        };
        let handle = self
            .runtime
            .spawn(run::run_pipeline(Arc::clone(&self.shared), ctx, guard));
        gate.active_run = Some(handle.abort_handle());

        TriggerOutcome::Started { run_id }
    }

    /// Per-frame entry point for hosts with a pull-style frame source
    ///
    /// The admission gate is checked before the source is asked for a
    /// frame, so a dropped tick never consumes one.
    pub fn tick(&self, source: &mut dyn FrameSource) -> TriggerOutcome {
        let now = Instant::now();
        {
            let gate = self.shared.gate.lock();
            if let Some(outcome) = self.admission(&gate, now) {
                drop(gate);
                self.housekeeping(now);
                return outcome;
            }
        }

        match source.try_acquire_frame() {
            Some(frame) => self.trigger(frame),
            None => {
                self.shared.monitor.increment(Counter::FramesUnavailable);
                self.housekeeping(now);
                TriggerOutcome::NoFrame
            }
        }
    }

    fn admission(&self, gate: &Gate, now: Instant) -> Option<TriggerOutcome> {
        match self.state() {
            SchedulerState::ShutDown => return Some(TriggerOutcome::ShutDown),
            SchedulerState::Running => {
                self.shared.monitor.increment(Counter::DroppedBusy);
                return Some(TriggerOutcome::DroppedBusy);
            }
            SchedulerState::Idle => {}
        }

        if let (Some(min), Some(last)) = (self.shared.config.min_run_interval(), gate.last_start) {
            if now.saturating_duration_since(last) < min {
                self.shared.monitor.increment(Counter::DroppedRateLimited);
                return Some(TriggerOutcome::DroppedRateLimited);
            }
        }
        None
    }

    /// Memory watchdog and periodic performance log
    fn housekeeping(&self, now: Instant) {
        if self.state() == SchedulerState::ShutDown {
            return;
        }
        if let Some(report) = self.shared.watchdog.lock().poll(&self.shared.pool, now) {
            tracing::trace!(
                "Memory check: {} -> {} bytes, {} outstanding",
                report.bytes_before,
                report.bytes_after,
                report.outstanding
            );
        }
        let resolution = self.current_resolution();
        self.shared
            .monitor
            .maybe_log(now, resolution, &self.shared.pool.metrics());
    }

    /// Run a memory check now, regardless of the check interval
    pub fn check_memory(&self) -> MemoryReport {
        self.shared
            .watchdog
            .lock()
            .check(&self.shared.pool, Instant::now())
    }

    /// Wait until no run is in flight
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `shared`, so the channel cannot close here
        let _ = rx.wait_for(|s| *s != SchedulerState::Running).await;
    }

    /// Register a mask observer
    pub fn subscribe(&self) -> Result<MaskSubscription> {
        self.shared.observers.subscribe()
    }

    /// Remove a mask observer
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.shared.observers.unsubscribe(id)
    }

    /// Live mask observers
    pub fn subscriber_count(&self) -> usize {
        self.shared.observers.len()
    }

    /// Working resolution the next run will use
    pub fn current_resolution(&self) -> Resolution {
        self.shared.quality.lock().current_resolution()
    }

    /// Rolling average run latency in milliseconds
    pub fn average_latency_ms(&self) -> f32 {
        self.shared.quality.lock().average_latency_ms()
    }

    /// Enable or disable adaptive resolution
    pub fn set_adaptive_resolution(&self, adaptive: bool) {
        self.shared.quality.lock().set_adaptive(adaptive);
    }

    /// Pin the working resolution (clamped to bounds), disabling adaptation
    pub fn set_fixed_resolution(&self, resolution: Resolution) -> Resolution {
        self.shared.quality.lock().set_fixed_resolution(resolution)
    }

    /// Time since the last published mask
    pub fn mask_age(&self) -> Option<Duration> {
        self.shared
            .last_mask_at
            .lock()
            .map(|at| Instant::now().saturating_duration_since(at))
    }

    /// Whether the last mask is older than `max_mask_age_ms` (or missing)
    pub fn is_mask_stale(&self) -> bool {
        match self.mask_age() {
            Some(age) => age > self.shared.config.max_mask_age(),
            None => true,
        }
    }

    /// Counters and stage latencies
    pub fn performance_snapshot(&self) -> PerformanceSnapshot {
        self.shared.monitor.snapshot()
    }

    /// Prometheus text export of the performance metrics
    pub fn to_prometheus(&self) -> String {
        self.shared.monitor.to_prometheus()
    }

    /// Buffer pool counters
    pub fn pool_metrics(&self) -> PoolMetrics {
        self.shared.pool.metrics()
    }

    /// The buffer pool
    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.shared.pool
    }

    /// Inference output shape in use
    pub fn output_shape(&self) -> TensorShape {
        self.shared.output_shape
    }

    /// Active configuration
    pub fn config(&self) -> &SegmentationConfig {
        &self.shared.config
    }

    /// Cancel any in-flight run, release every pooled buffer and close all
    /// subscriptions
    ///
    /// Waits for a cancelled run to unwind, so the reported leak count
    /// includes only buffers held outside the scheduler.
    pub async fn shutdown(&self) -> ShutdownReport {
        let (active, previous) = {
            let mut gate = self.shared.gate.lock();
            let previous = self.shared.state.send_replace(SchedulerState::ShutDown);
            (gate.active_run.take(), previous)
        };
        let aborted_run = previous == SchedulerState::Running;
        if let Some(handle) = active {
            handle.abort();
        }

        // The run holds the stage lock until its future is dropped
        let stages = self.shared.stages.lock().await.take();
        drop(stages);

        let observers_closed = self.shared.observers.close();
        let leaked_buffers = self.shared.pool.release_all();
        let pool = self.shared.pool.metrics();

        if previous != SchedulerState::ShutDown {
            tracing::info!(
                "Frame scheduler shut down (aborted run: {}, leaked buffers: {}, {} runs ok)",
                aborted_run,
                leaked_buffers,
                self.shared.monitor.count(Counter::RunsSucceeded)
            );
        }

        ShutdownReport {
            aborted_run,
            leaked_buffers,
            observers_closed,
            pool,
        }
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.shared.gate.lock().active_run.take() {
            handle.abort();
        }
    }
}
