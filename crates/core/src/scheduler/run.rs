//! One segmentation run
//!
//! convert -> infer -> reconstruct -> publish. Every pooled buffer a run
//! acquires is held by a guard, so an error or a cancelled task returns it to
//! the pool. Nothing is published unless all mandatory stages succeed.

use std::sync::Arc;
use std::time::{Duration, Instant as WallInstant};
use tokio::time::Instant;

use super::observer::{MaskUpdate, COVERAGE_THRESHOLD};
use super::{RunGuard, Shared};
use crate::data::{ImageBuffer, PixelFormat, RawFrame, Resolution};
use crate::inference;
use crate::monitor::{Counter, Stage};
use crate::reconstruct::ReconstructionReport;
use crate::tensor::TensorBuffer;
use crate::{Error, Result};

/// Per-run state carried through the stages
#[derive(Debug)]
pub struct RunContext {
    /// Monotonic run identifier
    pub run_id: u64,

    /// Frame the run was triggered with
    pub frame: RawFrame,

    /// Working resolution snapshot taken at run start
    pub working_resolution: Resolution,

    /// When the trigger was accepted
    pub triggered_at: Instant,

    started: WallInstant,
    conversion: Duration,
    inference: Duration,
}

impl RunContext {
    /// Create the context for an accepted trigger
    pub fn new(run_id: u64, frame: RawFrame, working_resolution: Resolution, triggered_at: Instant) -> Self {
        Self {
            run_id,
            frame,
            working_resolution,
            triggered_at,
            started: WallInstant::now(),
            conversion: Duration::ZERO,
            inference: Duration::ZERO,
        }
    }

    /// Processing time so far
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

struct Completed {
    mask: ImageBuffer,
    report: ReconstructionReport,
}

/// Task body spawned for every accepted trigger
pub(crate) async fn run_pipeline(shared: Arc<Shared>, mut ctx: RunContext, _guard: RunGuard) {
    shared.monitor.increment(Counter::RunsStarted);
    tracing::trace!(
        "Run {} started for frame {} at {}",
        ctx.run_id,
        ctx.frame.frame_number,
        ctx.working_resolution
    );

    match execute_stages(&shared, &mut ctx).await {
        Ok(completed) => publish(&shared, &ctx, completed),
        Err(e) => {
            let counter = match &e {
                Error::Conversion(_) => Some(Counter::ConversionFailures),
                Error::Inference(_) => Some(Counter::InferenceFailures),
                Error::Reconstruction { .. } => Some(Counter::ReconstructionFailures),
                _ => None,
            };
            if let Some(counter) = counter {
                shared.monitor.increment(counter);
            }
            shared.monitor.increment(Counter::RunsFailed);
            if matches!(e, Error::ShutDown) {
                tracing::debug!("Run {} abandoned: scheduler shut down", ctx.run_id);
            } else {
                tracing::error!("Run {} failed, no mask published: {}", ctx.run_id, e);
            }
        }
    }
}

async fn execute_stages(shared: &Shared, ctx: &mut RunContext) -> Result<Completed> {
    let mut stages = shared.stages.lock().await;
    let stages = stages.as_mut().ok_or(Error::ShutDown)?;

    // (a) conversion into a pooled RGBA buffer at the working resolution
    let started = WallInstant::now();
    let tensor = {
        let mut input = shared.pool.acquire(ctx.working_resolution, PixelFormat::Rgba32)?;
        stages.converter.convert(&ctx.frame, &mut input).await?;
        TensorBuffer::from_image(&input).map_err(|e| Error::Conversion(e.to_string()))?
    };
    ctx.conversion = started.elapsed();

    // (b) inference
    let started = WallInstant::now();
    let result = inference::execute(stages.engine.as_mut(), &tensor).await?;
    drop(tensor);
    ctx.inference = started.elapsed();

    // (c) reconstruction
    let report = stages.reconstructor.reconstruct(&result, Instant::now())?;
    let mask = stages.reconstructor.display_mask().duplicate();

    Ok(Completed { mask, report })
}

fn publish(shared: &Shared, ctx: &RunContext, completed: Completed) {
    let Completed { mask, report } = completed;
    let latency = ctx.elapsed();
    let produced_at = Instant::now();
    let coverage = mask.fraction_above(COVERAGE_THRESHOLD);

    if report.is_degraded() {
        tracing::warn!(
            "Run {} published a degraded mask: {:?}",
            ctx.run_id,
            report.degradation
        );
        shared.monitor.increment(Counter::DegradedMasks);
    }

    let update = Arc::new(MaskUpdate {
        run_id: ctx.run_id,
        frame_number: ctx.frame.frame_number,
        mask,
        produced_at,
        working_resolution: ctx.working_resolution,
        degradation: report.degradation,
        coverage,
        latency,
    });
    let delivered = shared.observers.publish(update);
    *shared.last_mask_at.lock() = Some(produced_at);

    let monitor = &shared.monitor;
    monitor.increment(Counter::RunsSucceeded);
    monitor.increment(Counter::MasksPublished);
    monitor.set_coverage(coverage);
    monitor.record_stage(Stage::Conversion, ctx.conversion);
    monitor.record_stage(Stage::Inference, ctx.inference);
    monitor.record_stage(Stage::Render, report.timings.render);
    monitor.record_stage(Stage::Denoise, report.timings.denoise);
    monitor.record_stage(Stage::Upscale, report.timings.upscale);
    monitor.record_stage(Stage::Blend, report.timings.blend);
    monitor.record_stage(Stage::Total, latency);

    tracing::trace!(
        "Run {} published to {} observers in {:?} (coverage {:.3})",
        ctx.run_id,
        delivered,
        latency,
        coverage
    );

    if shared.quality.lock().observe(latency, produced_at).is_some() {
        monitor.increment(Counter::ResolutionChanges);
    }
}
