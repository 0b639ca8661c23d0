use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dataflow_pipeline::{BatchSink, IterSource, MemoryDestination, Passthrough, PipelineBuilder};
use std::time::Duration;

fn run_chain(records: usize, hops: usize, capacity: usize, batch_size: usize) {
    let mut builder = PipelineBuilder::new().with_capacity(capacity);
    let mut channel = builder
        .add_source(IterSource::new(
            "source",
            (0..records).map(|i| vec![i as u8; 64]),
        ))
        .expect("Add source failed");

    for hop in 0..hops {
        channel = builder
            .add_transform(&channel, Passthrough::new(format!("stage{hop}")))
            .expect("Add transform failed");
    }
    builder.add_sink(BatchSink::new(&channel, MemoryDestination::new("sink")).with_batch_size(batch_size));

    let pipeline = builder.build().expect("Build failed");
    black_box(pipeline.run().expect("Run failed"));
}

fn benchmark_single_stage_throughput(c: &mut Criterion) {
    c.bench_function("single_stage_1000_records", |b| {
        b.iter(|| run_chain(1000, 1, 1000, 100));
    });
}

fn benchmark_three_stage_throughput(c: &mut Criterion) {
    c.bench_function("three_stage_1000_records", |b| {
        b.iter(|| run_chain(1000, 3, 1000, 100));
    });
}

fn benchmark_high_throughput(c: &mut Criterion) {
    c.bench_function("high_throughput_5000_records", |b| {
        b.iter(|| run_chain(5000, 2, 2000, 1000));
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10));
    targets = benchmark_single_stage_throughput, benchmark_three_stage_throughput, benchmark_high_throughput
);
criterion_main!(benches);
