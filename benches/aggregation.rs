/// Reduction and rendering cost of one checkpoint
///
/// A checkpoint holds the report writer lock while it reduces and renders, so
/// these numbers bound how long a periodic checkpoint can delay the drain.
use callbench::aggregate::ResultAggregator;
use callbench::config::SortKey;
use callbench::counters::{CallId, CounterSample, RawSnapshot};
use callbench::report::{render, Snapshot, TableLayout};
use callbench::syscalls::SyscallTable;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

/// Every known call identifier with `slots` samples each
fn synthetic_snapshot(slots: usize) -> RawSnapshot {
    (0u32..=462)
        .map(|id| {
            let samples = (0..slots)
                .map(|slot| {
                    let count = u64::from(id) * 7 + slot as u64;
                    CounterSample::new(count, count * 1_250)
                })
                .collect();
            (CallId(id), samples)
        })
        .collect()
}

fn bench_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce");

    for slots in [1usize, 16, 128] {
        let raw = synthetic_snapshot(slots);
        group.throughput(Throughput::Elements((raw.len() * slots) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(slots), &raw, |b, raw| {
            let agg = ResultAggregator::new(Arc::new(SyscallTable), true, SortKey::AvgOverhead);
            b.iter(|| black_box(agg.reduce(black_box(raw))));
        });
    }

    group.finish();
}

fn bench_sort_keys(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_key");
    let raw = synthetic_snapshot(16);

    for (label, key) in [
        ("name", SortKey::Name),
        ("id", SortKey::Id),
        ("count", SortKey::Count),
        ("overhead", SortKey::Overhead),
        ("avg_overhead", SortKey::AvgOverhead),
    ] {
        let agg = ResultAggregator::new(Arc::new(SyscallTable), true, key);
        group.bench_function(label, |b| b.iter(|| black_box(agg.reduce(&raw))));
    }

    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let agg = ResultAggregator::new(Arc::new(SyscallTable), true, SortKey::Count);
    let snapshot = Snapshot {
        index: 0,
        start_time: Some(chrono::Local::now()),
        current_time: chrono::Local::now(),
        records: agg.reduce(&synthetic_snapshot(16)),
    };
    let layout = TableLayout {
        show_id: true,
        show_average: true,
    };

    c.bench_function("render_full_table", |b| {
        b.iter(|| black_box(render(black_box(&snapshot), layout)))
    });
}

criterion_group!(benches, bench_reduce, bench_sort_keys, bench_render);
criterion_main!(benches);
