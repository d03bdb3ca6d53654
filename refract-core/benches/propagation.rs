//! Propagation benchmarks
//!
//! Measures the cost of a write travelling through chains and fan-outs of
//! derived values into effects, and what batching saves.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use refract_core::{Cell, Derived, Runtime};

/// `depth` derived values in a line, with one effect at the end.
fn chain(rt: &Runtime, depth: usize) -> (Cell<i64>, Arc<AtomicI64>) {
    let source = rt.cell(0_i64);
    let first = source.clone();
    let mut tail: Derived<i64> = rt.derived(move || first.read() + 1);
    for _ in 1..depth {
        let previous = tail.clone();
        tail = rt.derived(move || previous.read() + 1);
    }

    let sink = Arc::new(AtomicI64::new(0));
    let sink_clone = sink.clone();
    rt.effect(move || sink_clone.store(tail.read(), Ordering::Relaxed));
    (source, sink)
}

/// One cell read by `width` derived values, each observed by an effect.
fn fan_out(rt: &Runtime, width: usize) -> Cell<i64> {
    let source = rt.cell(0_i64);
    for i in 0..width {
        let source_clone = source.clone();
        let derived = rt.derived(move || source_clone.read() * i as i64);
        rt.effect(move || {
            black_box(derived.read());
        });
    }
    source
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");
    for depth in [1_usize, 10, 100] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            let rt = Runtime::new();
            let (source, sink) = chain(&rt, depth);
            let mut value = 0;
            b.iter(|| {
                value += 1;
                source.write(value);
                black_box(sink.load(Ordering::Relaxed));
            });
            rt.reset();
        });
    }
    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    for width in [10_usize, 100, 1000] {
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            let rt = Runtime::new();
            let source = fan_out(&rt, width);
            let mut value = 0;
            b.iter(|| {
                value += 1;
                source.write(value);
            });
        });
    }
    group.finish();
}

fn bench_batching(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_100_writes");

    group.bench_function("unbatched", |b| {
        let rt = Runtime::new();
        let (source, _sink) = chain(&rt, 10);
        let mut value = 0;
        b.iter(|| {
            for _ in 0..100 {
                value += 1;
                source.write(value);
            }
        });
        rt.reset();
    });

    group.bench_function("batched", |b| {
        let rt = Runtime::new();
        let (source, _sink) = chain(&rt, 10);
        let mut value = 0;
        b.iter(|| {
            rt.batch(|| {
                for _ in 0..100 {
                    value += 1;
                    source.write(value);
                }
            });
        });
        rt.reset();
    });

    group.finish();
}

criterion_group!(benches, bench_chain, bench_fan_out, bench_batching);
criterion_main!(benches);
