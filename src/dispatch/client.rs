//! # Dispatch Client
//!
//! ## Responsibility
//! Issue calls to the worker over one multiplexed TCP connection. Each call
//! gets a fresh `call_id`, is written by a dedicated writer task and resolved
//! by a reader task that routes replies back through per-call oneshots.
//!
//! ## Guarantees
//! - Timeout-bounded: every call ends within `call_timeout`
//! - Fail-fast: when the connection dies every pending call resolves with
//!   `Disconnected`; later calls reconnect, subject to backoff
//! - Keepalive: a ping unanswered within `keepalive_timeout` marks the
//!   connection dead
//! - Lock discipline: the connection state lock is never held across an await
//!
//! ## NOT Responsible For
//! - Retrying calls
//! - Interpreting `success = false` replies (callers classify those)

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::codec;
use super::protocol::{
    DetectionResponse, Frame, FrameKind, ImageInput, OcrResponse, RpcRequest, RpcResponse,
    TranscriptionResponse, VqaResponse, WorkerHealth, BATCH_TRACE_IDS_KEY, TRACE_ID_KEY,
};
use super::DispatchError;
use crate::config::ChannelSection;
use crate::{metrics, TraceId};

/// Depth of the per-connection outbound frame queue.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Tuned channel settings.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Largest frame accepted or sent, in bytes.
    pub max_message_bytes: usize,
    /// Interval between keepalive pings.
    pub keepalive_interval: Duration,
    /// How long a ping may go unanswered.
    pub keepalive_timeout: Duration,
    /// First reconnect backoff delay.
    pub reconnect_initial: Duration,
    /// Reconnect backoff cap.
    pub reconnect_max: Duration,
    /// Bound on establishing a TCP connection.
    pub connect_timeout: Duration,
    /// Bound on one whole call, connect included.
    pub call_timeout: Duration,
}

impl ChannelSettings {
    /// Build from the `[channel]` config section.
    pub fn from_section(section: &ChannelSection) -> Self {
        Self {
            max_message_bytes: section.max_message_bytes,
            keepalive_interval: Duration::from_millis(section.keepalive_interval_ms),
            keepalive_timeout: Duration::from_millis(section.keepalive_timeout_ms),
            reconnect_initial: Duration::from_millis(section.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(section.reconnect_max_ms),
            connect_timeout: Duration::from_millis(section.connect_timeout_ms),
            call_timeout: Duration::from_millis(section.call_timeout_ms),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from_section(&ChannelSection::default())
    }
}

type ReplySlot = oneshot::Sender<Result<RpcResponse, DispatchError>>;

/// State shared between a connection's tasks and its callers.
struct ConnShared {
    pending: DashMap<u64, ReplySlot>,
    alive: AtomicBool,
}

impl ConnShared {
    fn new() -> Self {
        Self {
            pending: DashMap::new(),
            alive: AtomicBool::new(true),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Mark the connection dead and fail every pending call.
    fn fail_all(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                let _ = slot.send(Err(DispatchError::Disconnected));
            }
        }
    }
}

/// Removes a call's reply slot however the call ends.
struct PendingGuard<'a> {
    shared: &'a ConnShared,
    call_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.call_id);
    }
}

/// One live TCP connection and its background tasks.
struct Connection {
    shared: Arc<ConnShared>,
    writer_tx: mpsc::Sender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    async fn open(addr: &str, settings: &ChannelSettings) -> Result<Self, DispatchError> {
        let stream = timeout(settings.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DispatchError::Connect {
                addr: addr.to_string(),
                reason: format!("timed out after {}ms", settings.connect_timeout.as_millis()),
            })?
            .map_err(|e| DispatchError::Connect {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(ConnShared::new());
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        let (pong_tx, pong_rx) = watch::channel(0u64);
        let max = settings.max_message_bytes;

        let writer = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut out = BufWriter::new(write_half);
                while let Some(body) = writer_rx.recv().await {
                    if let Err(e) = codec::write_body(&mut out, &body).await {
                        warn!(error = %e, "dispatch write failed");
                        break;
                    }
                }
                shared.fail_all();
            })
        };

        let reader = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut input = BufReader::new(read_half);
                loop {
                    match codec::read_frame(&mut input, max).await {
                        Ok(Some(Frame {
                            call_id,
                            kind: FrameKind::Reply(response),
                        })) => {
                            if let Some((_, slot)) = shared.pending.remove(&call_id) {
                                let _ = slot.send(Ok(response));
                            } else {
                                debug!(call_id, "reply for abandoned call discarded");
                            }
                        }
                        Ok(Some(Frame {
                            call_id,
                            kind: FrameKind::Pong,
                        })) => {
                            pong_tx.send_replace(call_id);
                        }
                        Ok(Some(frame)) => {
                            warn!(call_id = frame.call_id, "unexpected frame from worker");
                        }
                        Ok(None) => {
                            debug!("worker closed the connection");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "dispatch read failed");
                            break;
                        }
                    }
                }
                shared.fail_all();
            })
        };

        let keepalive = {
            let shared = Arc::clone(&shared);
            let writer_tx = writer_tx.clone();
            let interval = settings.keepalive_interval;
            let deadline = settings.keepalive_timeout;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                let mut seq = 0u64;
                loop {
                    ticker.tick().await;
                    if !shared.is_alive() {
                        break;
                    }
                    seq += 1;
                    let ping = Frame {
                        call_id: seq,
                        kind: FrameKind::Ping,
                    };
                    let Ok(body) = codec::encode_frame(&ping, max) else {
                        break;
                    };
                    if writer_tx.send(body).await.is_err() {
                        break;
                    }
                    let mut pongs = pong_rx.clone();
                    let answered = timeout(deadline, async {
                        loop {
                            if *pongs.borrow_and_update() >= seq {
                                return true;
                            }
                            if pongs.changed().await.is_err() {
                                return false;
                            }
                        }
                    })
                    .await;
                    if !matches!(answered, Ok(true)) {
                        warn!(
                            timeout_ms = deadline.as_millis() as u64,
                            "keepalive unanswered, dropping connection"
                        );
                        shared.fail_all();
                        break;
                    }
                }
            })
        };

        Ok(Self {
            shared,
            writer_tx,
            tasks: vec![writer, reader, keepalive],
        })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.shared.fail_all();
    }
}

struct ConnState {
    active: Option<Arc<Connection>>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

struct ClientInner {
    addr: String,
    settings: ChannelSettings,
    state: Mutex<ConnState>,
    // Serializes connect attempts so concurrent callers share one socket.
    connect_gate: tokio::sync::Mutex<()>,
    next_call_id: AtomicU64,
}

/// Client side of the worker channel.
///
/// Cheap to clone; clones share the connection. The connection is opened
/// lazily on the first call and reopened after it dies.
///
/// # Example
///
/// ```no_run
/// use tokio_inference_gateway::dispatch::{ChannelSettings, DispatchClient};
/// use tokio_inference_gateway::TraceId;
///
/// # async fn example() -> Result<(), tokio_inference_gateway::DispatchError> {
/// let client = DispatchClient::new("127.0.0.1:50051", ChannelSettings::default());
/// let health = client.health(&TraceId::generate()).await?;
/// println!("{} calls in flight", health.in_flight);
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct DispatchClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for DispatchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchClient")
            .field("addr", &self.inner.addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl DispatchClient {
    /// Create a client for the worker at `addr`. Does not connect.
    pub fn new(addr: impl Into<String>, settings: ChannelSettings) -> Self {
        let backoff = Backoff::new(settings.reconnect_initial, settings.reconnect_max).with_jitter(0.2);
        Self {
            inner: Arc::new(ClientInner {
                addr: addr.into(),
                settings,
                state: Mutex::new(ConnState {
                    active: None,
                    backoff,
                    retry_at: None,
                }),
                connect_gate: tokio::sync::Mutex::new(()),
                next_call_id: AtomicU64::new(1),
            }),
        }
    }

    /// Worker address this client targets.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Channel settings in effect.
    pub fn settings(&self) -> &ChannelSettings {
        &self.inner.settings
    }

    /// Whether a live connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .active
            .as_ref()
            .is_some_and(|c| c.shared.is_alive())
    }

    /// Open the connection now instead of on the first call.
    ///
    /// # Errors
    ///
    /// `Connect` or `Backoff` if the worker cannot be reached.
    pub async fn connect(&self) -> Result<(), DispatchError> {
        self.connection().await.map(|_| ())
    }

    /// Drop the connection. Pending calls fail with `Disconnected`.
    pub fn close(&self) {
        let dropped = self.inner.state.lock().active.take();
        if dropped.is_some() {
            debug!(addr = %self.inner.addr, "dispatch connection closed");
        }
    }

    /// Live connection, if any, or the backoff error if one is active.
    fn live_connection(&self) -> Result<Option<Arc<Connection>>, DispatchError> {
        let dead;
        {
            let mut state = self.inner.state.lock();
            if let Some(conn) = state.active.as_ref().filter(|c| c.shared.is_alive()) {
                return Ok(Some(Arc::clone(conn)));
            }
            dead = state.active.take();
            if let Some(at) = state.retry_at {
                let now = Instant::now();
                if now < at {
                    return Err(DispatchError::Backoff {
                        remaining_ms: (at - now).as_millis() as u64,
                    });
                }
            }
        }
        if dead.is_some() {
            debug!(addr = %self.inner.addr, "discarding dead connection");
        }
        Ok(None)
    }

    async fn connection(&self) -> Result<Arc<Connection>, DispatchError> {
        if let Some(conn) = self.live_connection()? {
            return Ok(conn);
        }
        let _gate = self.inner.connect_gate.lock().await;
        if let Some(conn) = self.live_connection()? {
            return Ok(conn);
        }

        match Connection::open(&self.inner.addr, &self.inner.settings).await {
            Ok(conn) => {
                let conn = Arc::new(conn);
                let mut state = self.inner.state.lock();
                state.active = Some(Arc::clone(&conn));
                state.backoff.reset();
                state.retry_at = None;
                info!(addr = %self.inner.addr, "connected to worker");
                Ok(conn)
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                let delay = state.backoff.next_delay();
                state.retry_at = Some(Instant::now() + delay);
                warn!(
                    addr = %self.inner.addr,
                    error = %e,
                    attempt = state.backoff.attempts(),
                    retry_in_ms = delay.as_millis() as u64,
                    "worker connect failed"
                );
                Err(e)
            }
        }
    }

    /// Send one call and wait for its reply.
    ///
    /// `RpcResponse::Error` replies are turned into `Remote` or
    /// `ShuttingDown` errors.
    ///
    /// # Errors
    ///
    /// Any [`DispatchError`]; `Timeout` once `call_timeout` elapses.
    pub async fn call(
        &self,
        request: RpcRequest,
        metadata: HashMap<String, String>,
    ) -> Result<RpcResponse, DispatchError> {
        let method = request.method();
        let call_timeout = self.inner.settings.call_timeout;
        let started = Instant::now();

        let result = match timeout(call_timeout, self.send_and_wait(request, metadata)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout {
                method,
                timeout_ms: call_timeout.as_millis() as u64,
            }),
        };
        metrics::observe_dispatch(method, started.elapsed());

        match result {
            Ok(RpcResponse::Error {
                message,
                shutting_down: true,
            }) => Err(DispatchError::ShuttingDown(message)),
            Ok(RpcResponse::Error { message, .. }) => Err(DispatchError::Remote(message)),
            Ok(response) => Ok(response),
            Err(e) => {
                debug!(method, error = %e, "dispatch call failed");
                Err(e)
            }
        }
    }

    async fn send_and_wait(
        &self,
        request: RpcRequest,
        metadata: HashMap<String, String>,
    ) -> Result<RpcResponse, DispatchError> {
        let call_id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame {
            call_id,
            kind: FrameKind::Call { metadata, request },
        };
        let body = codec::encode_frame(&frame, self.inner.settings.max_message_bytes)?;
        drop(frame);

        let conn = self.connection().await?;
        let (tx, rx) = oneshot::channel();
        conn.shared.pending.insert(call_id, tx);
        let _guard = PendingGuard {
            shared: &conn.shared,
            call_id,
        };
        if !conn.shared.is_alive() {
            return Err(DispatchError::Disconnected);
        }
        conn.writer_tx
            .send(body)
            .await
            .map_err(|_| DispatchError::Disconnected)?;
        rx.await.unwrap_or(Err(DispatchError::Disconnected))
    }

    /// Detect objects in one image.
    ///
    /// # Errors
    ///
    /// Any [`DispatchError`]; `Protocol` if the worker answers with the wrong kind.
    pub async fn detect_objects(
        &self,
        filename: &str,
        image: Vec<u8>,
        trace_id: &TraceId,
    ) -> Result<DetectionResponse, DispatchError> {
        let request = RpcRequest::DetectObjects {
            filename: filename.to_string(),
            image,
        };
        match self.call(request, trace_metadata(trace_id)).await? {
            RpcResponse::Detection(r) => Ok(r),
            other => Err(unexpected("Detection", &other)),
        }
    }

    /// Detect objects in several images with one model call.
    ///
    /// The first trace id travels as `x-request-id`; all of them travel,
    /// comma-separated, as `x-batch-request-ids`.
    ///
    /// # Errors
    ///
    /// Any [`DispatchError`]; `Protocol` if the reply count does not match.
    pub async fn detect_objects_batch(
        &self,
        images: Vec<ImageInput>,
        trace_ids: &[TraceId],
    ) -> Result<Vec<DetectionResponse>, DispatchError> {
        let expected = images.len();
        let mut metadata = trace_metadata(trace_ids.first().unwrap_or(&TraceId::unknown()));
        let joined: Vec<&str> = trace_ids.iter().map(TraceId::as_str).collect();
        metadata.insert(BATCH_TRACE_IDS_KEY.to_string(), joined.join(","));

        match self
            .call(RpcRequest::DetectObjectsBatch { images }, metadata)
            .await?
        {
            RpcResponse::DetectionBatch(results) if results.len() == expected => Ok(results),
            RpcResponse::DetectionBatch(results) => Err(DispatchError::Protocol(format!(
                "batch reply has {} results for {} images",
                results.len(),
                expected
            ))),
            other => Err(unexpected("DetectionBatch", &other)),
        }
    }

    /// Extract text from an image.
    ///
    /// # Errors
    ///
    /// Any [`DispatchError`].
    pub async fn extract_text(
        &self,
        filename: &str,
        image: Vec<u8>,
        language: &str,
        trace_id: &TraceId,
    ) -> Result<OcrResponse, DispatchError> {
        let request = RpcRequest::ExtractText {
            filename: filename.to_string(),
            image,
            language: language.to_string(),
        };
        match self.call(request, trace_metadata(trace_id)).await? {
            RpcResponse::Ocr(r) => Ok(r),
            other => Err(unexpected("Ocr", &other)),
        }
    }

    /// Transcribe an audio clip.
    ///
    /// # Errors
    ///
    /// Any [`DispatchError`].
    pub async fn transcribe_audio(
        &self,
        filename: &str,
        audio: Vec<u8>,
        trace_id: &TraceId,
    ) -> Result<TranscriptionResponse, DispatchError> {
        let request = RpcRequest::TranscribeAudio {
            filename: filename.to_string(),
            audio,
        };
        match self.call(request, trace_metadata(trace_id)).await? {
            RpcResponse::Transcription(r) => Ok(r),
            other => Err(unexpected("Transcription", &other)),
        }
    }

    /// Answer a question about an image.
    ///
    /// # Errors
    ///
    /// Any [`DispatchError`].
    pub async fn answer_visual_question(
        &self,
        filename: &str,
        image: Vec<u8>,
        question: &str,
        trace_id: &TraceId,
    ) -> Result<VqaResponse, DispatchError> {
        let request = RpcRequest::AnswerVisualQuestion {
            filename: filename.to_string(),
            image,
            question: question.to_string(),
        };
        match self.call(request, trace_metadata(trace_id)).await? {
            RpcResponse::Vqa(r) => Ok(r),
            other => Err(unexpected("Vqa", &other)),
        }
    }

    /// Ask the worker for its readiness and load.
    ///
    /// # Errors
    ///
    /// Any [`DispatchError`].
    pub async fn health(&self, trace_id: &TraceId) -> Result<WorkerHealth, DispatchError> {
        match self.call(RpcRequest::Health, trace_metadata(trace_id)).await? {
            RpcResponse::Health(h) => Ok(h),
            other => Err(unexpected("Health", &other)),
        }
    }
}

fn trace_metadata(trace_id: &TraceId) -> HashMap<String, String> {
    let mut metadata = HashMap::with_capacity(2);
    metadata.insert(TRACE_ID_KEY.to_string(), trace_id.to_string());
    metadata
}

fn unexpected(expected: &str, got: &RpcResponse) -> DispatchError {
    DispatchError::Protocol(format!("expected {expected} reply, got {}", got.kind()))
}
