//! # DynamicBatcher
//!
//! ## Responsibility
//! Coalesce concurrent single-item requests into batches and run them through
//! a caller-supplied batch function, then hand each caller its own result.
//!
//! ## Guarantees
//! - Size or time: a batch flushes as soon as it holds `max_batch_size`
//!   items, or once `max_wait` has elapsed since its oldest item arrived
//! - Exactly once: every queued item's result slot is resolved exactly once,
//!   even if the caller stopped waiting
//! - Positional: within a batch, result `i` goes to item `i`
//! - Serialised: at most one batch is being processed at any time; items that
//!   arrive mid-flush are picked up by a follow-up flush
//! - Contained: a failing or panicking batch function fails every member of
//!   that batch with the same error and nothing else
//!
//! ## NOT Responsible For
//! - Retrying failed batches
//! - Cancelling queued items (an abandoned item is still processed)
//! - Cross-batch ordering

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::{metrics, TraceId};

/// Errors delivered to a caller of [`DynamicBatcher::add`].
#[derive(Debug, Error)]
pub enum BatchError<E> {
    /// The batch function returned an error; every member gets the same one.
    #[error("batch processing failed: {0}")]
    Process(Arc<E>),

    /// The batch function returned the wrong number of results.
    #[error("batch processor returned {got} results for {expected} inputs")]
    ResultCountMismatch {
        /// Items in the batch.
        expected: usize,
        /// Results returned.
        got: usize,
    },

    /// The batch function panicked.
    #[error("batch processor panicked: {0}")]
    Panicked(String),

    /// The batcher was dropped before the item was resolved.
    #[error("batch result slot dropped before resolution")]
    Abandoned,
}

impl<E> Clone for BatchError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Process(e) => Self::Process(Arc::clone(e)),
            Self::ResultCountMismatch { expected, got } => Self::ResultCountMismatch {
                expected: *expected,
                got: *got,
            },
            Self::Panicked(msg) => Self::Panicked(msg.clone()),
            Self::Abandoned => Self::Abandoned,
        }
    }
}

/// Metadata passed to the batch function alongside the payloads.
#[derive(Debug, Clone)]
pub struct BatchMeta {
    /// Monotonic sequence number of this batch within its batcher.
    pub batch_id: u64,
    /// Trace ids of the members, in payload order.
    pub trace_ids: Vec<TraceId>,
}

/// Observability snapshot of a batcher.
#[derive(Debug, Clone, Serialize)]
pub struct BatcherSnapshot {
    /// Batcher name.
    pub name: String,
    /// Items waiting to be flushed.
    pub queue_size: usize,
    /// Whether a batch is in flight.
    pub is_processing: bool,
    /// Flush size trigger.
    pub max_batch_size: usize,
    /// Flush time trigger in milliseconds.
    pub max_wait_ms: u64,
    /// Batches handed to the batch function.
    pub batches_flushed: u64,
    /// Items handed to the batch function.
    pub items_processed: u64,
}

type ProcessFn<T, R, E> =
    Box<dyn Fn(Vec<T>, BatchMeta) -> BoxFuture<'static, Result<Vec<R>, E>> + Send + Sync>;

struct BatchItem<T, R, E> {
    payload: T,
    slot: oneshot::Sender<Result<R, BatchError<E>>>,
    trace_id: TraceId,
    enqueued_at: Instant,
}

struct QueueState<T, R, E> {
    queue: VecDeque<BatchItem<T, R, E>>,
    timer_armed: bool,
    processing: bool,
    next_batch_id: u64,
    batches_flushed: u64,
    items_processed: u64,
}

struct Shared<T, R, E> {
    name: String,
    max_batch_size: usize,
    max_wait: Duration,
    process: ProcessFn<T, R, E>,
    state: Mutex<QueueState<T, R, E>>,
}

enum Trigger {
    Flush,
    ArmTimer,
    None,
}

/// Generic request-coalescing engine.
///
/// Cheap to clone; clones feed the same queue. Must be used from within a
/// Tokio runtime, since flushes run on spawned tasks.
pub struct DynamicBatcher<T, R, E> {
    shared: Arc<Shared<T, R, E>>,
}

impl<T, R, E> Clone for DynamicBatcher<T, R, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, R, E> std::fmt::Debug for DynamicBatcher<T, R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicBatcher")
            .field("name", &self.shared.name)
            .field("max_batch_size", &self.shared.max_batch_size)
            .field("max_wait", &self.shared.max_wait)
            .finish()
    }
}

impl<T, R, E> DynamicBatcher<T, R, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + Sync + 'static,
{
    /// Create a batcher around `process`.
    ///
    /// `max_batch_size` is clamped to at least 1.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        max_batch_size: usize,
        max_wait: Duration,
        process: F,
    ) -> Self
    where
        F: Fn(Vec<T>, BatchMeta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<R>, E>> + Send + 'static,
    {
        let name = name.into();
        let max_batch_size = max_batch_size.max(1);
        debug!(batcher = %name, max_batch_size, ?max_wait, "batcher created");
        Self {
            shared: Arc::new(Shared {
                name,
                max_batch_size,
                max_wait,
                process: Box::new(move |items, meta| process(items, meta).boxed()),
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    timer_armed: false,
                    processing: false,
                    next_batch_id: 0,
                    batches_flushed: 0,
                    items_processed: 0,
                }),
            }),
        }
    }

    /// Enqueue `payload` and wait for its result.
    ///
    /// # Errors
    ///
    /// Any [`BatchError`] produced while processing the batch the item landed in.
    pub async fn add(&self, payload: T, trace_id: TraceId) -> Result<R, BatchError<E>> {
        let (tx, rx) = oneshot::channel();

        let (trigger, queue_size) = {
            let mut state = self.shared.state.lock();
            state.queue.push_back(BatchItem {
                payload,
                slot: tx,
                trace_id: trace_id.clone(),
                enqueued_at: Instant::now(),
            });
            let len = state.queue.len();
            let trigger = if len >= self.shared.max_batch_size {
                Trigger::Flush
            } else if !state.timer_armed {
                state.timer_armed = true;
                Trigger::ArmTimer
            } else {
                Trigger::None
            };
            (trigger, len)
        };

        debug!(
            batcher = %self.shared.name,
            trace_id = %trace_id,
            queue_size,
            "item added to batch queue"
        );

        match trigger {
            Trigger::Flush => {
                tokio::spawn(Arc::clone(&self.shared).run_flushes());
            }
            Trigger::ArmTimer => {
                tokio::spawn(Arc::clone(&self.shared).run_timer());
            }
            Trigger::None => {}
        }

        rx.await.unwrap_or(Err(BatchError::Abandoned))
    }

    /// Items waiting to be flushed.
    pub fn queue_size(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Whether a batch is currently being processed.
    pub fn is_processing(&self) -> bool {
        self.shared.state.lock().processing
    }

    /// Batcher name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Longest an item waits in the queue before a partial batch is flushed.
    pub fn max_wait(&self) -> Duration {
        self.shared.max_wait
    }

    /// Point-in-time snapshot.
    pub fn snapshot(&self) -> BatcherSnapshot {
        let state = self.shared.state.lock();
        BatcherSnapshot {
            name: self.shared.name.clone(),
            queue_size: state.queue.len(),
            is_processing: state.processing,
            max_batch_size: self.shared.max_batch_size,
            max_wait_ms: u64::try_from(self.shared.max_wait.as_millis()).unwrap_or(u64::MAX),
            batches_flushed: state.batches_flushed,
            items_processed: state.items_processed,
        }
    }
}

impl<T, R, E> Shared<T, R, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + Sync + 'static,
{
    /// Sleep until the oldest queued item is due, then flush.
    async fn run_timer(self: Arc<Self>) {
        let oldest = {
            let state = self.state.lock();
            state.queue.front().map(|item| item.enqueued_at)
        };
        let mut deadline = oldest.unwrap_or_else(Instant::now) + self.max_wait;
        loop {
            tokio::time::sleep_until(deadline).await;
            let next = {
                let mut state = self.state.lock();
                match state.queue.front() {
                    None => {
                        state.timer_armed = false;
                        return;
                    }
                    Some(oldest) => {
                        let due = oldest.enqueued_at + self.max_wait;
                        if due <= Instant::now() {
                            state.timer_armed = false;
                            None
                        } else {
                            Some(due)
                        }
                    }
                }
            };
            match next {
                Some(due) => deadline = due,
                None => break,
            }
        }
        self.run_flushes().await;
    }

    /// Flush batches until the queue is empty, unless a flush is already running.
    async fn run_flushes(self: Arc<Self>) {
        loop {
            let (batch, batch_id) = {
                let mut state = self.state.lock();
                if state.processing || state.queue.is_empty() {
                    return;
                }
                state.processing = true;
                let n = state.queue.len().min(self.max_batch_size);
                let batch: Vec<_> = state.queue.drain(..n).collect();
                let batch_id = state.next_batch_id;
                state.next_batch_id += 1;
                state.batches_flushed += 1;
                state.items_processed += batch.len() as u64;
                (batch, batch_id)
            };

            self.process_batch(batch, batch_id).await;

            let more = {
                let mut state = self.state.lock();
                state.processing = false;
                !state.queue.is_empty()
            };
            if !more {
                return;
            }
        }
    }

    async fn process_batch(&self, batch: Vec<BatchItem<T, R, E>>, batch_id: u64) {
        let size = batch.len();
        metrics::observe_batch_size(&self.name, size);

        let mut payloads = Vec::with_capacity(size);
        let mut slots = Vec::with_capacity(size);
        let mut trace_ids = Vec::with_capacity(size);
        for item in batch {
            payloads.push(item.payload);
            slots.push(item.slot);
            trace_ids.push(item.trace_id);
        }

        debug!(
            batcher = %self.name,
            batch_id,
            batch_size = size,
            trace_ids = ?trace_ids.iter().map(TraceId::as_str).collect::<Vec<_>>(),
            "processing batch"
        );

        let meta = BatchMeta {
            batch_id,
            trace_ids,
        };
        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            (self.process)(payloads, meta)
        })) {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(panic) => Err(panic),
        };

        let failure = match outcome {
            Ok(Ok(results)) if results.len() == size => {
                for (slot, result) in slots.into_iter().zip(results) {
                    // A dropped receiver means the caller gave up; discard.
                    let _ = slot.send(Ok(result));
                }
                debug!(batcher = %self.name, batch_id, batch_size = size, "batch processed");
                return;
            }
            Ok(Ok(results)) => BatchError::ResultCountMismatch {
                expected: size,
                got: results.len(),
            },
            Ok(Err(e)) => BatchError::Process(Arc::new(e)),
            Err(panic) => BatchError::Panicked(panic_message(panic.as_ref())),
        };

        error!(
            batcher = %self.name,
            batch_id,
            batch_size = size,
            error = %failure_kind(&failure),
            "batch processing failed"
        );
        for slot in slots {
            let _ = slot.send(Err(failure.clone()));
        }
    }
}

fn failure_kind<E>(err: &BatchError<E>) -> String {
    match err {
        BatchError::Process(_) => "process".to_string(),
        BatchError::ResultCountMismatch { expected, got } => {
            format!("result count mismatch ({got} for {expected})")
        }
        BatchError::Panicked(msg) => format!("panic: {msg}"),
        BatchError::Abandoned => "abandoned".to_string(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Error, PartialEq)]
    #[error("model exploded")]
    struct Boom;

    fn doubling(calls: Arc<AtomicUsize>) -> DynamicBatcher<u32, u32, Boom> {
        DynamicBatcher::new("test", 4, Duration::from_millis(50), move |items, _meta| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(items.into_iter().map(|x| x * 2).collect()) }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_after_max_wait() {
        let calls = Arc::new(AtomicUsize::new(0));
        let b = doubling(Arc::clone(&calls));
        let start = Instant::now();

        let results = futures::future::join_all(
            (1..=3).map(|i| b.add(i, TraceId::new(format!("r{i}")))),
        )
        .await;

        let values: Vec<u32> = results
            .into_iter()
            .map(|r| r.expect("test: result"))
            .collect();
        assert_eq!(values, vec![2, 4, 6]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(50) && waited < Duration::from_millis(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let b = doubling(Arc::clone(&calls));
        let start = Instant::now();

        let results =
            futures::future::join_all((0..4).map(|i| b.add(i, TraceId::unknown()))).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_splits_into_ordered_batches() {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&sizes);
        let b: DynamicBatcher<u32, u32, Boom> =
            DynamicBatcher::new("split", 4, Duration::from_millis(50), move |items, _| {
                recorded.lock().push(items.len());
                async move { Ok(items) }
            });

        let results =
            futures::future::join_all((0..10).map(|i| b.add(i, TraceId::unknown()))).await;
        let values: Vec<u32> = results.into_iter().map(|r| r.expect("test: ok")).collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
        let mut seen = sizes.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![2, 4, 4]);
        assert_eq!(b.snapshot().items_processed, 10);
        assert_eq!(b.snapshot().batches_flushed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_error_reaches_every_member() {
        let b: DynamicBatcher<u32, u32, Boom> =
            DynamicBatcher::new("err", 8, Duration::from_millis(10), |_, _| async {
                Err(Boom)
            });
        let results =
            futures::future::join_all((0..3).map(|i| b.add(i, TraceId::unknown()))).await;
        let errors: Vec<_> = results.into_iter().map(|r| r.unwrap_err()).collect();
        assert_eq!(errors.len(), 3);
        let first = match &errors[0] {
            BatchError::Process(e) => Arc::clone(e),
            other => panic!("unexpected {other:?}"),
        };
        for e in &errors {
            match e {
                BatchError::Process(inner) => assert!(Arc::ptr_eq(inner, &first)),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_count_mismatch_fails_all() {
        let b: DynamicBatcher<u32, u32, Boom> =
            DynamicBatcher::new("short", 8, Duration::from_millis(10), |_, _| async {
                Ok(vec![1])
            });
        let results =
            futures::future::join_all((0..2).map(|i| b.add(i, TraceId::unknown()))).await;
        for r in results {
            assert!(matches!(
                r,
                Err(BatchError::ResultCountMismatch {
                    expected: 2,
                    got: 1
                })
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_in_process_is_contained() {
        let b: DynamicBatcher<u32, u32, Boom> =
            DynamicBatcher::new("panic", 2, Duration::from_millis(10), |items, _| async move {
                if items.contains(&13) {
                    panic!("unlucky");
                }
                Ok(items)
            });

        let bad = futures::future::join_all([
            b.add(13, TraceId::unknown()),
            b.add(1, TraceId::unknown()),
        ])
        .await;
        for r in bad {
            assert!(matches!(r, Err(BatchError::Panicked(ref m)) if m == "unlucky"));
        }
        // The batcher keeps working afterwards.
        let good = b.add(5, TraceId::unknown()).await;
        assert_eq!(good.expect("test: recovered"), 5);
        assert!(!b.is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_meta_carries_trace_ids_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        let b: DynamicBatcher<u32, u32, Boom> =
            DynamicBatcher::new("meta", 3, Duration::from_millis(10), move |items, meta| {
                recorded.lock().push(meta);
                async move { Ok(items) }
            });
        let _ = futures::future::join_all(
            ["a", "b", "c"]
                .into_iter()
                .enumerate()
                .map(|(i, id)| b.add(i as u32, TraceId::new(id))),
        )
        .await;
        let metas = seen.lock();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].batch_id, 0);
        let ids: Vec<&str> = metas[0].trace_ids.iter().map(TraceId::as_str).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_caller_item_still_processed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let b = doubling(Arc::clone(&calls));
        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), b.add(1, TraceId::unknown())).await;
        assert!(timed_out.is_err());
        assert_eq!(b.queue_size(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.queue_size(), 0);
    }

    #[test]
    fn test_zero_batch_size_clamped() {
        let b: DynamicBatcher<u32, u32, Boom> =
            DynamicBatcher::new("clamp", 0, Duration::from_millis(1), |items, _| async move {
                Ok(items)
            });
        assert_eq!(b.snapshot().max_batch_size, 1);
    }
}
