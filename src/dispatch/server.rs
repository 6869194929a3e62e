//! # Dispatch Server
//!
//! ## Responsibility
//! Accept loopback connections from the gateway, decode call frames, run each
//! call concurrently through a [`CallHandler`] and write replies back on the
//! same connection. Answers keepalive pings.
//!
//! ## Guarantees
//! - Loopback only: binding a non-loopback address is refused
//! - Traced: each call runs inside an `rpc` span carrying `trace_id` and `method`
//! - Every call gets exactly one reply, even if the handler panics
//! - Draining: after shutdown is signalled, new calls are answered with a
//!   `shutting_down` error while in-flight calls run to completion
//!
//! ## NOT Responsible For
//! - Model execution (see `worker::service`)
//! - Process lifetime (see the `inference-worker` binary)

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec;
use super::protocol::{Frame, FrameKind, RpcRequest, RpcResponse, BATCH_TRACE_IDS_KEY, TRACE_ID_KEY};
use super::DispatchError;
use crate::TraceId;

/// Per-call information extracted from frame metadata.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Trace id of the originating request, or `-` if none was sent.
    pub trace_id: TraceId,
    /// Raw call metadata.
    pub metadata: HashMap<String, String>,
}

impl CallContext {
    /// Build a context from call metadata.
    pub fn from_metadata(metadata: HashMap<String, String>) -> Self {
        let trace_id = metadata
            .get(TRACE_ID_KEY)
            .map_or_else(TraceId::unknown, |id| TraceId::new(id.clone()));
        Self { trace_id, metadata }
    }

    /// Trace ids of every member of a batch call, in batch order.
    pub fn batch_trace_ids(&self) -> Vec<TraceId> {
        self.metadata
            .get(BATCH_TRACE_IDS_KEY)
            .map(|ids| {
                ids.split(',')
                    .filter(|s| !s.is_empty())
                    .map(TraceId::new)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Handles decoded calls on the worker side.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    /// Produce the reply for one call.
    async fn handle(&self, request: RpcRequest, ctx: CallContext) -> RpcResponse;
}

#[derive(Debug, Default)]
struct InFlightInner {
    count: AtomicUsize,
    idle: Notify,
}

/// Count of calls currently being handled.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    inner: Arc<InFlightInner>,
}

impl InFlight {
    /// Calls currently running.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlightGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Wait until no call is running, for at most `grace`.
    ///
    /// Returns `true` if the server went idle in time.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count() == 0;
            }
        }
    }
}

struct InFlightGuard {
    inner: Arc<InFlightInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Worker-side listener.
pub struct RpcServer<H> {
    listener: TcpListener,
    handler: Arc<H>,
    max_message_bytes: usize,
    in_flight: InFlight,
}

impl<H: CallHandler> RpcServer<H> {
    /// Bind a loopback listener.
    ///
    /// # Errors
    ///
    /// `Io` if the bind fails, `Protocol` if the address is not loopback.
    pub async fn bind(addr: &str, handler: Arc<H>, max_message_bytes: usize) -> Result<Self, DispatchError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        if !local.ip().is_loopback() {
            return Err(DispatchError::Protocol(format!(
                "refusing to serve on non-loopback address {local}"
            )));
        }
        Ok(Self {
            listener,
            handler,
            max_message_bytes,
            in_flight: InFlight::default(),
        })
    }

    /// Address actually bound (useful with port 0).
    ///
    /// # Errors
    ///
    /// `Io` if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, DispatchError> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle on the in-flight call count; stays valid after `serve` returns.
    pub fn in_flight(&self) -> InFlight {
        self.in_flight.clone()
    }

    /// Accept connections until `shutdown` becomes `true` or its sender drops.
    ///
    /// Connection tasks keep running after this returns so in-flight calls
    /// can reply; wait on [`InFlight::wait_idle`] to drain them.
    ///
    /// # Errors
    ///
    /// This function currently never fails; accept errors are logged.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), DispatchError> {
        let local = self.listener.local_addr()?;
        info!(addr = %local, "dispatch server listening");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "gateway connected");
                        tokio::spawn(serve_connection(
                            stream,
                            Arc::clone(&self.handler),
                            self.max_message_bytes,
                            self.in_flight.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(in_flight = self.in_flight.count(), "dispatch server stopped accepting");
        Ok(())
    }
}

async fn serve_connection<H: CallHandler>(
    stream: TcpStream,
    handler: Arc<H>,
    max_message_bytes: usize,
    in_flight: InFlight,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let (read_half, write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Frame>(64);

    let writer = tokio::spawn(async move {
        let mut out = BufWriter::new(write_half);
        while let Some(frame) = rx.recv().await {
            let call_id = frame.call_id;
            let body = match codec::encode_frame(&frame, max_message_bytes) {
                Ok(body) => body,
                Err(e) => {
                    warn!(call_id, error = %e, "reply could not be encoded");
                    let fallback = Frame {
                        call_id,
                        kind: FrameKind::Reply(RpcResponse::Error {
                            message: e.to_string(),
                            shutting_down: false,
                        }),
                    };
                    match codec::encode_frame(&fallback, max_message_bytes) {
                        Ok(body) => body,
                        Err(_) => continue,
                    }
                }
            };
            if let Err(e) = codec::write_body(&mut out, &body).await {
                debug!(error = %e, "reply write failed");
                break;
            }
        }
    });

    let mut input = BufReader::new(read_half);
    loop {
        let frame = match codec::read_frame(&mut input, max_message_bytes).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("gateway disconnected");
                break;
            }
            Err(e) => {
                warn!(error = %e, "dropping connection after bad frame");
                break;
            }
        };

        let call_id = frame.call_id;
        match frame.kind {
            FrameKind::Ping => {
                if tx.send(Frame { call_id, kind: FrameKind::Pong }).await.is_err() {
                    break;
                }
            }
            FrameKind::Call { metadata, request } => {
                let ctx = CallContext::from_metadata(metadata);
                if *shutdown.borrow() {
                    debug!(trace_id = %ctx.trace_id, "refusing call while draining");
                    let reply = RpcResponse::Error {
                        message: "worker is shutting down".to_string(),
                        shutting_down: true,
                    };
                    if tx.send(Frame { call_id, kind: FrameKind::Reply(reply) }).await.is_err() {
                        break;
                    }
                    continue;
                }

                let guard = in_flight.enter();
                let span = info_span!("rpc", trace_id = %ctx.trace_id, method = request.method(), call_id);
                let handler = Arc::clone(&handler);
                let tx = tx.clone();
                tokio::spawn(
                    async move {
                        let _guard = guard;
                        let started = Instant::now();
                        let reply = AssertUnwindSafe(handler.handle(request, ctx))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                warn!("call handler panicked");
                                RpcResponse::Error {
                                    message: "call handler panicked".to_string(),
                                    shutting_down: false,
                                }
                            });
                        debug!(
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            reply = reply.kind(),
                            "call handled"
                        );
                        let _ = tx.send(Frame { call_id, kind: FrameKind::Reply(reply) }).await;
                    }
                    .instrument(span),
                );
            }
            FrameKind::Reply(_) | FrameKind::Pong => {
                warn!(call_id, "unexpected frame from gateway");
            }
        }
    }

    drop(tx);
    let _ = writer.await;
}
