use criterion::{black_box, criterion_group, criterion_main, Criterion};
use printlink_communication::protocol::{parse_framed, render_framed};
use printlink_communication::{PlannerConfig, PlannerFedEstimator};
use std::time::Duration;

fn bench_framing(c: &mut Criterion) {
    c.bench_function("render_framed", |b| {
        b.iter(|| render_framed(black_box("G1 X125.432 Y87.001 E12.5532 F1800"), black_box(123_456)))
    });

    let framed = render_framed("G1 X125.432 Y87.001 E12.5532 F1800", 123_456);
    c.bench_function("parse_framed", |b| b.iter(|| parse_framed(black_box(&framed))));
}

fn bench_estimator(c: &mut Criterion) {
    c.bench_function("planner_observe", |b| {
        let mut estimator = PlannerFedEstimator::new(PlannerConfig {
            window_size: 1_000,
            threshold_path: None,
            ..PlannerConfig::default()
        });
        let mut tick = 0u64;
        b.iter(|| {
            tick = tick.wrapping_add(7_919);
            estimator.observe(black_box(Duration::from_micros(tick % 200_000)));
            estimator.is_fed()
        })
    });
}

criterion_group!(benches, bench_framing, bench_estimator);
criterion_main!(benches);
