//! # Worker
//!
//! ## Responsibility
//! Everything on the far side of the process boundary: the model backend
//! seam, the call handler that drives it from a bounded blocking pool, the
//! scratch directory for temporary audio files, and the supervisor the
//! gateway uses to start, watch and stop the worker process.
//!
//! ## Guarantees
//! - Isolated: model state lives only in the worker process
//! - Bounded: at most `model_threads` model calls run at once
//! - Tidy: temporary audio files are removed after use and swept on shutdown
//! - Supervised: the gateway learns the worker's address from a readiness
//!   line and stops it with a bounded grace period
//!
//! ## NOT Responsible For
//! - Automatic restart of a dead worker (calls fail fast instead)
//! - Real model inference (only [`SimulatedBackend`] ships here)

pub mod backend;
pub mod scratch;
pub mod service;
pub mod supervisor;

use thiserror::Error;

pub use backend::{InferenceBackend, SimulatedBackend, Transcript, MODEL_NAMES};
pub use scratch::ScratchDir;
pub use service::InferenceService;
pub use supervisor::{watch_liveness, WorkerLaunch, WorkerProcess, READY_PREFIX};

/// Failure of a single model call inside the worker.
///
/// Reported back to the gateway as `success = false`, never as a transport
/// error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The payload or question cannot be processed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The model failed to load at start-up.
    #[error("model {model} not ready: {reason}")]
    NotReady {
        /// Model name.
        model: String,
        /// Load failure.
        reason: String,
    },

    /// The model ran but failed.
    #[error("inference failed: {0}")]
    Inference(String),

    /// Staging the payload failed.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Errors from starting or stopping the worker process.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The worker binary could not be located.
    #[error("worker binary not found: {0}")]
    BinaryNotFound(String),

    /// The OS refused to start the process.
    #[error("failed to spawn worker {binary}: {source}")]
    Spawn {
        /// Path of the binary.
        binary: String,
        /// OS error.
        #[source]
        source: std::io::Error,
    },

    /// The worker did not print its readiness line in time.
    #[error("worker did not become ready within {timeout_ms}ms")]
    StartupTimeout {
        /// Configured start-up timeout.
        timeout_ms: u64,
    },

    /// The worker exited or printed garbage before becoming ready.
    #[error("worker handshake failed: {0}")]
    Handshake(String),

    /// The worker did not exit after being killed.
    #[error("worker did not exit: {0}")]
    Stuck(String),

    /// Process I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
