//! # Resilience Primitive Contracts
//!
//! The observable contracts of the batcher, breaker, degradation controller
//! and buffer pool, exercised through the public API with paused time where
//! timing matters.

use futures::future::join_all;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_inference_gateway::resilience::{
    BatchError, BufferPool, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitStatus, DegradationController, DynamicBatcher, ServiceStatus,
};
use tokio_inference_gateway::TraceId;

fn counting_batcher(
    calls: Arc<AtomicUsize>,
    max_batch_size: usize,
    max_wait: Duration,
) -> DynamicBatcher<u32, String, String> {
    DynamicBatcher::new("contract", max_batch_size, max_wait, move |items: Vec<u32>, _meta| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if items.contains(&13) {
                return Err("unlucky batch".to_string());
            }
            Ok(items.into_iter().map(|i| format!("result-{i}")).collect())
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_eight_items_flush_at_once_three_after_max_wait() {
    let calls = Arc::new(AtomicUsize::new(0));
    let batcher = counting_batcher(Arc::clone(&calls), 8, Duration::from_millis(50));

    let start = Instant::now();
    let full = join_all((0..8).map(|i| batcher.add(i, TraceId::new(format!("f{i}"))))).await;
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for (i, result) in full.into_iter().enumerate() {
        assert_eq!(result.expect("test: full batch"), format!("result-{i}"));
    }

    let start = Instant::now();
    let partial = join_all((20..23).map(|i| batcher.add(i, TraceId::unknown()))).await;
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(50) && waited < Duration::from_millis(60));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(partial.iter().all(Result::is_ok));
}

#[tokio::test(start_paused = true)]
async fn test_failed_batch_resolves_every_slot_with_the_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let batcher = counting_batcher(Arc::clone(&calls), 4, Duration::from_millis(10));

    let results = join_all([11, 12, 13, 14].map(|i| batcher.add(i, TraceId::unknown()))).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        match result {
            Err(BatchError::Process(e)) => assert_eq!(e.as_str(), "unlucky batch"),
            other => panic!("expected Process error, got {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_breaker_admits_exactly_the_probe_budget() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        name: "worker".to_string(),
        failure_threshold: 3,
        recovery_timeout: Duration::from_secs(30),
        half_open_max_calls: 2,
    });

    for _ in 0..3 {
        let r = breaker.execute(|| async { Err::<(), _>("boom") }).await;
        assert!(matches!(r, Err(CircuitBreakerError::Failed("boom"))));
    }
    assert!(!breaker.can_execute());

    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(!breaker.can_execute());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(breaker.status(), CircuitStatus::HalfOpen);

    // Hold two probes in flight; a third is rejected.
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);
    let probe = |mut rx: tokio::sync::watch::Receiver<bool>| {
        let breaker = breaker.clone();
        tokio::spawn(async move {
            breaker
                .execute(|| async move {
                    let _ = rx.wait_for(|go| *go).await;
                    Ok::<_, &str>(())
                })
                .await
        })
    };
    let first = probe(release_rx.clone());
    let second = probe(release_rx.clone());
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    let third = breaker.execute(|| async { Ok::<_, &str>(()) }).await;
    assert!(matches!(third, Err(CircuitBreakerError::Open { .. })));

    release_tx.send(true).expect("test: release");
    first.await.expect("test: join").expect("test: probe");
    second.await.expect("test: join").expect("test: probe");
    assert_eq!(breaker.status(), CircuitStatus::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovers_after_half_open_callers_give_up() {
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        name: "worker".to_string(),
        failure_threshold: 1,
        recovery_timeout: Duration::from_secs(30),
        half_open_max_calls: 2,
    });
    let _ = breaker.execute(|| async { Err::<(), _>("boom") }).await;
    tokio::time::advance(Duration::from_secs(31)).await;

    // Both half-open calls are abandoned by callers that stop waiting.
    for _ in 0..2 {
        let hung = breaker.execute(|| std::future::pending::<Result<(), &str>>());
        assert!(tokio::time::timeout(Duration::from_millis(10), hung).await.is_err());
    }

    tokio::time::advance(Duration::from_secs(3600)).await;
    assert!(breaker.can_execute());
    breaker
        .execute(|| async { Ok::<_, &str>(()) })
        .await
        .expect("test: healthy call admitted");
    assert_eq!(breaker.status(), CircuitStatus::Closed);
}

#[test]
fn test_degradation_thresholds() {
    let controller = DegradationController::new(4, Duration::from_secs(60));

    controller.record_failure("vqa");
    controller.record_failure("vqa");
    assert_eq!(controller.status("vqa"), ServiceStatus::Degraded);
    controller.record_failure("vqa");
    controller.record_failure("vqa");
    assert_eq!(controller.status("vqa"), ServiceStatus::Unavailable);

    controller.record_success("vqa");
    let health = controller.health("vqa").expect("test: health");
    assert_eq!(health.status, ServiceStatus::Healthy);
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(health.total_failures, 4);

    // Other services are untouched.
    assert_eq!(controller.status("ocr"), ServiceStatus::Healthy);
}

#[test]
fn test_pool_overflow_and_reset_on_release() {
    let pool = BufferPool::new("contract", 32, 2);

    let mut a = pool.acquire();
    a.write_all(b"secret").expect("test: write");
    let b = pool.acquire();
    let mut overflow = pool.acquire();
    assert!(a.is_pooled() && b.is_pooled());
    assert!(!overflow.is_pooled());
    overflow.write_all(b"still usable").expect("test: write overflow");
    assert_eq!(overflow.as_slice(), b"still usable");

    drop(overflow);
    assert_eq!(pool.snapshot().available, 0);
    drop(a);
    drop(b);
    assert_eq!(pool.snapshot().available, 2);

    let reused = pool.acquire();
    assert!(reused.is_pooled());
    assert!(reused.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_survives_concurrent_acquisitions_beyond_its_size() {
    let pool = BufferPool::new("contract", 256, 4);

    let tasks = (0..16u8).map(|i| {
        let pool = pool.clone();
        tokio::spawn(async move {
            let pattern = vec![i; 200];
            let mut buf = pool.acquire();
            assert!(buf.is_empty());
            buf.write_all(&pattern).expect("test: write");
            tokio::task::yield_now().await;
            assert_eq!(buf.as_slice(), pattern.as_slice(), "task {i} buffer was shared");
        })
    });
    for joined in join_all(tasks).await {
        joined.expect("test: task");
    }

    let snapshot = pool.snapshot();
    assert_eq!(snapshot.available, 4);
    assert_eq!(snapshot.in_use, 0);
    assert_eq!(snapshot.total_acquired, 16);
}
