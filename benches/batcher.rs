//! Resilience primitive benchmarks.
//!
//! - Full-batch flush through the dynamic batcher (no timer wait)
//! - Circuit breaker pass-through while closed
//! - Buffer pool acquire/release, pooled and overflow
//! - Cache key hashing of image-sized payloads

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures::future::join_all;
use std::io::Write;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_inference_gateway::edge::cache_key;
use tokio_inference_gateway::resilience::{
    BufferPool, CircuitBreaker, CircuitBreakerConfig, DynamicBatcher,
};
use tokio_inference_gateway::TraceId;

fn bench_batcher_full_flush(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("batcher_full_flush");

    for size in [1usize, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let batcher: DynamicBatcher<u64, u64, String> = DynamicBatcher::new(
                "bench",
                size,
                Duration::from_secs(10),
                |items: Vec<u64>, _meta| async move { Ok(items.into_iter().map(|x| x * 2).collect()) },
            );
            b.to_async(&rt).iter(|| {
                let batcher = batcher.clone();
                async move {
                    let adds = (0..size as u64).map(|i| batcher.add(i, TraceId::unknown()));
                    black_box(join_all(adds).await);
                }
            });
        });
    }
    group.finish();
}

fn bench_breaker_closed(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let breaker = CircuitBreaker::new(CircuitBreakerConfig::new("bench"));

    c.bench_function("breaker_execute_closed", |b| {
        b.to_async(&rt).iter(|| {
            let breaker = breaker.clone();
            async move {
                let result = breaker.execute(|| async { Ok::<_, ()>(black_box(1u8)) }).await;
                black_box(result.is_ok());
            }
        })
    });
}

fn bench_buffer_pool(c: &mut Criterion) {
    let pool = BufferPool::new("bench", 64 * 1024, 4);
    let chunk = vec![7u8; 16 * 1024];

    c.bench_function("pool_acquire_write_release", |b| {
        b.iter(|| {
            let mut buf = pool.acquire();
            buf.write_all(black_box(&chunk)).expect("write");
            black_box(buf.len());
        })
    });

    c.bench_function("pool_overflow_acquire", |b| {
        let held: Vec<_> = (0..4).map(|_| pool.acquire()).collect();
        b.iter(|| {
            let buf = pool.acquire();
            black_box(buf.is_pooled());
        });
        drop(held);
    });
}

fn bench_cache_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_key");
    for kib in [64usize, 1024] {
        let payload = vec![42u8; kib * 1024];
        group.bench_with_input(BenchmarkId::from_parameter(kib), &payload, |b, payload| {
            b.iter(|| black_box(cache_key("detect", black_box(payload))));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_batcher_full_flush,
    bench_breaker_closed,
    bench_buffer_pool,
    bench_cache_key
);
criterion_main!(benches);
