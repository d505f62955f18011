//! Benchmark for mask reconstruction and full-run latency
//!
//! Reconstruction runs on every frame, so its cost comes straight out of the
//! 50 ms per-run budget. Measured:
//! 1. Four-stage reconstruction at the default 160x120 -> 640x480 scale,
//!    with and without the optional stages
//! 2. One complete scheduler run (conversion, simulated inference,
//!    reconstruction, publish) at several working resolutions

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tokio::time::Instant;
use wallseg_core::config::BlendMode;
use wallseg_core::inference::SimulatedEngine;
use wallseg_core::tensor::{TensorBuffer, TensorShape};
use wallseg_core::{
    FrameScheduler, MaskReconstructor, PixelFormat, RawFrame, Resolution, ResourcePool,
    SegmentationConfig,
};

fn striped_result(shape: TensorShape) -> TensorBuffer {
    let data = (0..shape.element_count())
        .map(|i| if (i / 7) % 3 == 0 { 1.0 } else { 0.0 })
        .collect();
    TensorBuffer::from_vec(data, shape).expect("shape matches data")
}

fn bench_reconstruct(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let _guard = rt.enter();

    let shape = TensorShape::new(1, 1, 120, 160);
    let result = striped_result(shape);
    let variants = [
        ("render_upscale", SegmentationConfig::default().with_denoise(false)),
        ("with_denoise", SegmentationConfig::default()),
        (
            "with_denoise_and_blend",
            SegmentationConfig::default().with_temporal_blend(0.6, BlendMode::Exponential),
        ),
    ];

    let mut group = c.benchmark_group("reconstruct_640x480");
    group.throughput(Throughput::Elements(640 * 480));
    for (name, config) in variants {
        let pool = Arc::new(ResourcePool::new());
        let mut reconstructor =
            MaskReconstructor::new(pool, &config, shape).expect("reconstructor");
        group.bench_function(name, |b| {
            b.iter(|| {
                let report = reconstructor
                    .reconstruct(black_box(&result), Instant::now())
                    .expect("reconstruction");
                black_box(report.degradation)
            })
        });
    }
    group.finish();
}

fn bench_full_run(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");

    let mut group = c.benchmark_group("scheduler_run");
    for (w, h) in [(384u32, 288u32), (640, 480), (768, 576)] {
        let config = SegmentationConfig::default()
            .with_resolution_bounds(
                Resolution::new(384, 288),
                Resolution::new(768, 576),
                Resolution::new(64, 48),
            )
            .with_input_resolution(Resolution::new(w, h))
            .with_max_invocations_per_second(0.0);
        let scheduler = rt.block_on(async {
            let engine = SimulatedEngine::luma(TensorShape::new(1, 1, 120, 160));
            let scheduler = FrameScheduler::new(config, Box::new(engine)).expect("scheduler");
            scheduler.set_adaptive_resolution(false);
            scheduler
        });
        let frame = RawFrame::new(vec![96u8; 640 * 480 * 4], 640, 480, PixelFormat::Rgba32);

        group.bench_with_input(BenchmarkId::from_parameter(format!("{}x{}", w, h)), &frame, |b, frame| {
            b.to_async(&rt).iter(|| async {
                let outcome = scheduler.trigger(frame.clone());
                scheduler.wait_idle().await;
                black_box(outcome)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_reconstruct, bench_full_run);
criterion_main!(benches);
