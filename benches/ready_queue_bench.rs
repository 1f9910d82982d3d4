//! Ready queue throughput: insert N past-due metrics, then drain them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use edge_engine::{sampler_fn, sink_fn, MetricDefinition, MetricId, MetricSink, ReadyEntry, ReadyQueue, ScheduledMetric};

fn past_due(count: usize) -> Vec<ScheduledMetric> {
    let sink: Arc<dyn MetricSink> = Arc::new(sink_fn(|_, _| Ok(())));
    let base = Instant::now();
    (0..count)
        .map(|i| {
            // Spread deadlines so the heap actually reorders.
            let offset = Duration::from_micros(((i * 7919) % 10_000) as u64);
            let due = base.checked_sub(offset).unwrap_or(base);
            MetricDefinition::new(format!("bench.{}", i), sampler_fn(|| Ok(None)), sink.clone())
                .schedule(MetricId::from_raw(i as u64), due)
                .1
        })
        .collect()
}

fn bench_put_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("ready_queue");

    for count in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("put_then_drain", count), &count, |b, &count| {
            b.iter_batched(
                || past_due(count),
                |metrics| {
                    let queue = ReadyQueue::new();
                    for metric in metrics {
                        queue.put(metric);
                    }
                    let mut drained = 0usize;
                    while let Some(ReadyEntry::Metric(metric)) = queue.try_pop_due() {
                        black_box(metric.next_run_time());
                        drained += 1;
                    }
                    black_box(drained)
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_put_pop);
criterion_main!(benches);
