//! Session window operator benchmarks.

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use sluice_core::operator::session_window::{SessionWindowConfig, SessionWindowOperator};
use sluice_core::time::Watermark;

type Event = (i64, u64);

fn operator(timeout: i64) -> SessionWindowOperator<Event, u64, i64, i64> {
    SessionWindowOperator::new(SessionWindowConfig {
        session_timeout: timeout,
        timestamp_fn: Box::new(|e: &Event| e.0),
        key_fn: Box::new(|e: &Event| e.1),
        new_acc: Box::new(|| 0i64),
        accumulate: Box::new(|acc, _| *acc += 1),
        combine: Box::new(|left, right| *left += right),
        finish: Box::new(|acc| acc),
    })
    .expect("valid config")
}

fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("session_window");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("ingest_10k_events_100_keys", |b| {
        b.iter(|| {
            let mut op = operator(50);
            for i in 0..10_000i64 {
                op.accept(&(i, (i % 100) as u64));
            }
            op.complete().len()
        });
    });

    group.bench_function("ingest_10k_events_with_watermarks", |b| {
        b.iter(|| {
            let mut op = operator(50);
            let mut emitted = 0;
            for i in 0..10_000i64 {
                op.accept(&(i, (i % 100) as u64));
                if i % 1_000 == 0 {
                    emitted += op.accept_watermark(Watermark::new(i - 500)).len();
                }
            }
            emitted + op.complete().len()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_ingest);
criterion_main!(benches);
