//! Dispatch Path Benchmarks
//!
//! Measures the per-event overhead the core adds around a function call:
//! worker allocation, the submission protocol and event pool reuse.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use eventsource_core::event::EventPool;
use eventsource_core::runtime::EchoRuntime;
use eventsource_core::source::{BaseEventSource, SourceClass};
use eventsource_core::worker::{FixedPoolWorkerAllocator, Worker, WorkerAllocator, WorkerLease};
use eventsource_core::Event;

fn echo_workers(count: usize) -> Vec<Arc<Worker>> {
    (0..count)
        .map(|index| Arc::new(Worker::new(index, Arc::new(EchoRuntime))))
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("benchmark runtime")
}

/// Allocate and release one worker
fn benchmark_allocation(c: &mut Criterion) {
    let rt = runtime();
    let allocator: Arc<dyn WorkerAllocator> =
        Arc::new(FixedPoolWorkerAllocator::new(echo_workers(4)));

    c.bench_function("worker_lease", |b| {
        b.iter(|| {
            rt.block_on(async {
                let lease = WorkerLease::acquire(&allocator, None).await.unwrap();
                black_box(lease.index())
            })
        });
    });
}

/// Full submit: stamp, allocate, process, release
fn benchmark_submission(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("submit_event");

    for body_size in [16usize, 1024, 64 * 1024] {
        let source = BaseEventSource::new(
            "bench",
            "generator",
            SourceClass::Async,
            Arc::new(FixedPoolWorkerAllocator::new(echo_workers(1))),
        );
        let body = vec![b'x'; body_size];

        group.bench_with_input(BenchmarkId::new("body_bytes", body_size), &body, |b, body| {
            b.iter(|| {
                rt.block_on(async {
                    let mut event = Event::new(body.clone());
                    black_box(source.submit_event(&mut event, None).await)
                })
            });
        });
    }

    group.finish();
}

/// Borrow and return a pooled event
fn benchmark_event_pool(c: &mut Criterion) {
    let pool = Arc::new(EventPool::new(8));

    c.bench_function("event_pool_borrow", |b| {
        b.iter(|| {
            let mut event = pool.try_get().unwrap();
            event.body.extend_from_slice(b"payload");
            black_box(event.body.len())
        });
    });
}

criterion_group!(
    benches,
    benchmark_allocation,
    benchmark_submission,
    benchmark_event_pool
);
criterion_main!(benches);
