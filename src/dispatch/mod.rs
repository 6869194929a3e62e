//! # Dispatch
//!
//! ## Responsibility
//! Carry calls from the request-facing process to the isolated worker over a
//! single multiplexed loopback connection, with the caller's trace id as
//! call metadata.
//!
//! ## Guarantees
//! - Bounded: every call completes, fails or times out within `call_timeout`
//! - Fail-fast: a dead connection fails pending and new calls immediately
//! - Size-limited: frames above `max_message_bytes` are refused on both ends
//! - Spaced reconnects: failed connects back off exponentially up to a cap
//!
//! ## NOT Responsible For
//! - Retrying failed calls (callers choose their own policy)
//! - Circuit breaking or degradation (see `resilience`)
//! - Starting the worker process (see `worker::supervisor`)

pub mod backoff;
pub mod client;
pub mod codec;
pub mod protocol;
pub mod server;

use thiserror::Error;

pub use client::{ChannelSettings, DispatchClient};
pub use protocol::{
    DetectedObject, DetectionResponse, ImageInput, ModelStatus, OcrLine, OcrResponse, RpcRequest,
    RpcResponse, TranscriptionResponse, VqaResponse, WorkerHealth, BATCH_TRACE_IDS_KEY,
    TRACE_ID_KEY,
};
pub use server::{CallContext, CallHandler, InFlight, RpcServer};

/// Errors from the cross-process channel.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A connection to the worker could not be established.
    #[error("failed to connect to worker at {addr}: {reason}")]
    Connect {
        /// Worker address.
        addr: String,
        /// Underlying cause.
        reason: String,
    },

    /// The connection dropped while the call was pending, or was already dead.
    #[error("worker connection lost")]
    Disconnected,

    /// The call did not complete within the per-call timeout.
    #[error("{method} timed out after {timeout_ms}ms")]
    Timeout {
        /// RPC method name.
        method: &'static str,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// A recent connect attempt failed and the reconnect backoff has not elapsed.
    #[error("reconnect backoff active, next attempt in {remaining_ms}ms")]
    Backoff {
        /// Time left before the next connect attempt is allowed.
        remaining_ms: u64,
    },

    /// A frame exceeded the configured maximum message size.
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Encoded size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The peer sent something that does not fit the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The worker reported it could not handle the call.
    #[error("worker error: {0}")]
    Remote(String),

    /// The worker is draining and refused the call.
    #[error("worker shutting down: {0}")]
    ShuttingDown(String),

    /// Socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    /// True when the worker could not be reached or did not answer in time,
    /// as opposed to answering with an error.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::Disconnected
                | Self::Timeout { .. }
                | Self::Backoff { .. }
                | Self::ShuttingDown(_)
                | Self::Io(_)
        )
    }
}
