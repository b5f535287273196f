//! Benchmarks for queue manager operations over the in-memory store.
//!
//! Covers single and batch enqueue, claiming under worker contention, and the
//! full enqueue, claim, start, complete lifecycle.

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use conduit_testkit::{Harness, OrderSync, KLAVIYO_SYNC};
use tokio::runtime::Runtime;

fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn bench_enqueue_single(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("enqueue_single");
    group.sample_size(100);
    group.measurement_time(std::time::Duration::from_secs(10));

    group.bench_function("in_memory", |b| {
        let manager = Harness::new().manager();
        let order = OrderSync::new(1);

        b.to_async(&rt).iter(|| async {
            manager
                .enqueue(order.request())
                .await
                .expect("enqueue should succeed");
        });
    });

    group.finish();
}

/// Throughput of `enqueue_many` up to the default batch limit.
fn bench_enqueue_batch(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("enqueue_batch");
    group.sample_size(50);
    group.measurement_time(std::time::Duration::from_secs(15));

    for batch_size in [10u64, 50, 100] {
        group.throughput(Throughput::Elements(batch_size));
        group.bench_with_input(
            BenchmarkId::new("in_memory", batch_size),
            &batch_size,
            |b, &size| {
                let manager = Harness::new().manager();

                b.to_async(&rt).iter(|| async {
                    let requests = (0..size).map(|n| OrderSync::new(n).request()).collect();
                    manager
                        .enqueue_many(requests)
                        .await
                        .expect("batch enqueue should succeed");
                });
            },
        );
    }

    group.finish();
}

/// Concurrent workers racing for the head of one queue.
fn bench_claim_contention(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("claim_contention");
    group.sample_size(50);
    group.measurement_time(std::time::Duration::from_secs(15));

    for workers in [1usize, 5, 10, 20] {
        group.throughput(Throughput::Elements(workers as u64));
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            let manager = Arc::new(Harness::new().manager());

            b.to_async(&rt).iter(|| {
                let manager = Arc::clone(&manager);
                async move {
                    let requests = (0..workers as u64)
                        .map(|n| OrderSync::new(n).request())
                        .collect();
                    manager.enqueue_many(requests).await.expect("seed batch");

                    let handles: Vec<_> = (0..workers)
                        .map(|worker| {
                            let manager = Arc::clone(&manager);
                            tokio::spawn(async move {
                                manager
                                    .claim_next(KLAVIYO_SYNC, &format!("worker-{worker}"))
                                    .await
                            })
                        })
                        .collect();
                    for handle in handles {
                        let lease = handle.await.expect("claim task").expect("claim");
                        if let Some(lease) = lease {
                            manager.complete(&lease).await.expect("complete");
                        }
                    }
                }
            });
        });
    }

    group.finish();
}

fn bench_full_lifecycle(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("full_lifecycle");
    group.sample_size(50);
    group.measurement_time(std::time::Duration::from_secs(15));
    group.throughput(Throughput::Elements(1));

    group.bench_function("in_memory", |b| {
        let manager = Harness::new().manager();
        let order = OrderSync::new(1);

        b.to_async(&rt).iter(|| async {
            manager
                .enqueue(order.request())
                .await
                .expect("enqueue should succeed");
            let lease = manager
                .claim_next(KLAVIYO_SYNC, "worker-1")
                .await
                .expect("claim should succeed")
                .expect("should get a lease");
            let lease = manager
                .start(lease)
                .await
                .expect("start should succeed")
                .expect("lease should still be held");
            manager
                .complete(&lease)
                .await
                .expect("complete should succeed");
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_single,
    bench_enqueue_batch,
    bench_claim_contention,
    bench_full_lifecycle
);
criterion_main!(benches);
