//! Segmentation demo binary
//!
//! Drives the pipeline with synthetic camera frames and the simulated
//! engine, printing mask and performance statistics.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use wallseg_core::config::BlendMode;
use wallseg_core::inference::{self, InferenceEngine, ModelProvider, SimulatedProvider};
use wallseg_core::source::{FallbackFrameSource, SyntheticFrameSource};
use wallseg_core::{FrameScheduler, RawFrame, Resolution, SegmentationConfig};

#[derive(Parser, Debug)]
#[command(name = "segmentation-demo")]
#[command(about = "Run the adaptive segmentation pipeline on synthetic frames")]
struct Args {
    /// Configuration file (toml, json or yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding a model file
    #[arg(long)]
    model_dir: Option<PathBuf>,

    /// Preferred model file name inside --model-dir
    #[arg(long)]
    model_file: Option<String>,

    /// Camera frame rate driving the scheduler
    #[arg(long, default_value_t = 30.0)]
    fps: f32,

    /// Number of camera frames to offer
    #[arg(long, default_value_t = 300)]
    frames: u64,

    /// Camera frame width
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Camera frame height
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Enable temporal blending with this factor
    #[arg(long)]
    blend: Option<f32>,

    /// Pin the working resolution (WIDTHxHEIGHT) instead of adapting
    #[arg(long)]
    fixed_resolution: Option<String>,

    /// Print the final metrics in Prometheus format instead of JSON
    #[arg(long)]
    prometheus: bool,
}

fn parse_resolution(s: &str) -> Result<Resolution> {
    let (w, h) = s
        .split_once('x')
        .with_context(|| format!("expected WIDTHxHEIGHT, got '{}'", s))?;
    Ok(Resolution::new(w.trim().parse()?, h.trim().parse()?))
}

fn load_engine(args: &Args, config: &SegmentationConfig) -> Result<Box<dyn InferenceEngine>> {
    let provider = SimulatedProvider::new(config.inference.fallback_output_shape);
    match &args.model_dir {
        Some(dir) => {
            let path = inference::resolve_model_path(dir, args.model_file.as_deref())?;
            let providers: Vec<Box<dyn ModelProvider>> = vec![Box::new(provider)];
            Ok(inference::negotiate_engine(&providers, &path)?)
        }
        None => {
            tracing::info!("No model directory given, using simulated engine");
            Ok(provider.load_model(std::path::Path::new("simulated.model"))?)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    wallseg_core::init()?;

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SegmentationConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SegmentationConfig::default(),
    };
    if let Some(factor) = args.blend {
        config = config.with_temporal_blend(factor, BlendMode::Exponential);
    }

    tracing::info!("Starting segmentation demo");
    tracing::info!("  Camera: {}x{} @ {} fps", args.width, args.height, args.fps);
    tracing::info!("  Max runs/s: {}", config.max_invocations_per_second);
    tracing::info!("  Display: {}", config.display_resolution);

    let engine = load_engine(&args, &config)?;
    let fallback_threshold = config.simulation_fallback_threshold;
    let scheduler = FrameScheduler::new(config, engine)?;

    if let Some(fixed) = &args.fixed_resolution {
        let applied = scheduler.set_fixed_resolution(parse_resolution(fixed)?);
        tracing::info!("  Working resolution fixed at {}", applied);
    }

    let mut masks = scheduler.subscribe()?;
    tracing::info!("  Mask observers: {}", scheduler.subscriber_count());
    let consumer = tokio::spawn(async move {
        let mut received = 0u64;
        let mut degraded = 0u64;
        while let Some(update) = masks.recv().await {
            received += 1;
            if !update.degradation.is_empty() {
                degraded += 1;
            }
            if received % 10 == 0 {
                tracing::info!(
                    "Mask {} (frame {}): coverage {:.1}%, {} working, {:?}",
                    update.run_id,
                    update.frame_number,
                    update.coverage * 100.0,
                    update.working_resolution,
                    update.latency
                );
            }
        }
        (received, degraded, masks.skipped())
    });

    let camera_resolution = Resolution::new(args.width, args.height);
    let mut camera = SyntheticFrameSource::new(camera_resolution);
    let frames = args.frames;
    let mut offered = 0u64;
    // Drop every 50th frame at the primary source to exercise the fallback path
    let primary = move || -> Option<RawFrame> {
        offered += 1;
        if offered % 50 == 0 || offered > frames {
            None
        } else {
            Some(camera.next_frame())
        }
    };
    let mut source = FallbackFrameSource::new(primary, camera_resolution, fallback_threshold);

    let period = Duration::from_secs_f32(1.0 / args.fps.max(1.0));
    let mut ticker = tokio::time::interval(period);
    for _ in 0..args.frames {
        ticker.tick().await;
        scheduler.tick(&mut source);
    }
    scheduler.wait_idle().await;

    let snapshot = scheduler.performance_snapshot();
    if args.prometheus {
        println!("{}", scheduler.to_prometheus());
    } else {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    tracing::info!(
        "Average latency {:.1} ms, final working resolution {}, mask stale: {}",
        scheduler.average_latency_ms(),
        scheduler.current_resolution(),
        scheduler.is_mask_stale()
    );

    let report = scheduler.shutdown().await;
    let (received, degraded, skipped) = consumer.await?;
    tracing::info!(
        "Received {} masks ({} degraded, {} skipped), leaked buffers: {}",
        received,
        degraded,
        skipped,
        report.leaked_buffers
    );

    Ok(())
}
