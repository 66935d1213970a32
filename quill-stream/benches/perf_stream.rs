//! Benchmarks for the stream's submission and drain paths.

use std::io;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use quill_stream::{AsyncStream, IdleDriver, IgnorePolicy};

fn sink_stream() -> Arc<AsyncStream> {
    AsyncStream::builder()
        .sink(io::sink())
        .driver(Arc::new(IdleDriver))
        .error_policy(Arc::new(IgnorePolicy))
        .build()
}

fn bench_submit_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_latency");

    group.bench_function("bytes_16/submit_and_drain", |b| {
        let stream = sink_stream();
        b.iter(|| {
            stream.submit_bytes(black_box(b"0123456789abcdef"));
            stream.try_drain();
        });
    });

    group.bench_function("formatted_u64/submit_and_drain", |b| {
        let stream = sink_stream();
        b.iter(|| {
            stream.submit_formatted(black_box(123_456_789_u64));
            stream.try_drain();
        });
    });

    // Baseline: the same write done synchronously, no queue.
    group.bench_function("bytes_16/direct", |b| {
        use std::io::Write;
        let mut sink = io::sink();
        b.iter(|| {
            sink.write_all(black_box(b"0123456789abcdef")).unwrap();
        });
    });

    group.finish();
}

fn bench_burst_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("burst_throughput");

    for batch in [100usize, 1_000] {
        group.throughput(Throughput::Elements(batch as u64));

        group.bench_function(format!("bytes_16/{batch}"), |b| {
            let stream = sink_stream();
            b.iter(|| {
                for _ in 0..batch {
                    stream.submit_bytes(black_box(b"0123456789abcdef"));
                }
                stream.try_drain();
            });
        });

        group.bench_function(format!("formatted_u64/{batch}"), |b| {
            let stream = sink_stream();
            b.iter(|| {
                for i in 0..batch {
                    stream.submit_formatted(black_box(i as u64));
                }
                stream.try_drain();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_submit_latency, bench_burst_throughput);
criterion_main!(benches);
