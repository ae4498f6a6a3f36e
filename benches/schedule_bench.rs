use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use hybrid_ml_pipeline::{GenerateSchedule, InferenceSchedule, TrainSchedule};

fn bench_schedules(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule_generation");

    group.bench_function("inference_8x16", |b| {
        b.iter(|| {
            for stage in 0..8 {
                let sched = InferenceSchedule::new(16, 8, stage).unwrap();
                black_box(sched.count());
            }
        })
    });

    group.bench_function("train_1f1b_8x16", |b| {
        b.iter(|| {
            for stage in 0..8 {
                let sched = TrainSchedule::new(16, 8, stage).unwrap();
                black_box(sched.count());
            }
        })
    });

    group.bench_function("generate_8x16x256", |b| {
        b.iter(|| {
            for stage in 0..8 {
                let sched = GenerateSchedule::new(16, 8, stage, 256).unwrap();
                black_box(sched.count());
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_schedules);
criterion_main!(benches);
