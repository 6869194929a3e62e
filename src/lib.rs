//! # tokio-inference-gateway
//!
//! A resilient request-serving core for a multi-model inference tier over Tokio.
//!
//! ## Architecture
//!
//! The serving tier is split into a request-facing process and an isolated
//! worker process that owns the model state:
//! ```text
//! request → RequestPipeline ─┬─ DegradationController (fallback?)
//!                            ├─ DynamicBatcher (coalesce detection)
//!                            ├─ CircuitBreaker (per capability)
//!                            └─ DispatchClient ══ loopback ══► worker process
//!                                                              ├─ InferenceService
//!                                                              ├─ BufferPools
//!                                                              └─ InferenceBackend
//! ```
//!
//! ## Modules
//!
//! - [`resilience`]: batcher, circuit breaker, buffer pool, degradation
//! - [`dispatch`]: framed cross-process call protocol (client + server)
//! - [`worker`]: backend seam, worker-side call handler, process supervisor
//! - [`pipeline`]: the composition root serving the four capabilities
//! - [`edge`]: result cache and per-client rate limiter
//! - [`config`]: TOML configuration, validation, schema export
//! - [`metrics`]: Prometheus counters and histograms

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use std::fmt;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod dispatch;
pub mod edge;
pub mod metrics;
pub mod pipeline;
pub mod resilience;
pub mod worker;

// Re-exports for convenience
pub use config::GatewayConfig;
pub use dispatch::{DispatchClient, DispatchError};
pub use pipeline::{PipelineError, RequestPipeline};
pub use resilience::{BufferPool, CircuitBreaker, DegradationController, DynamicBatcher};
pub use worker::{SimulatedBackend, WorkerProcess};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`). Output is
/// written to stderr; the worker process reserves stdout for its readiness
/// line.
///
/// # Errors
///
/// Returns [`GatewayError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Example
///
/// ```no_run
/// # use tokio_inference_gateway::{init_tracing, GatewayError};
/// # fn example() -> Result<(), GatewayError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), GatewayError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init(),
    };

    result.map_err(|e| GatewayError::Other(format!("tracing init failed: {e}")))
}

/// Top-level gateway errors.
///
/// Module errors convert into this type with `?` at the binary boundary.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration could not be loaded or failed validation.
    #[error(transparent)]
    Config(#[from] config::validation::ConfigError),

    /// The cross-process channel failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The worker process could not be spawned, became unready, or failed to stop.
    #[error(transparent)]
    Worker(#[from] worker::WorkerError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Opaque request identifier propagated across the process boundary.
///
/// Attached to every dispatch call as `x-request-id` metadata so log lines in
/// both processes can be correlated for one logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraceId(String);

impl TraceId {
    /// Create a trace id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random trace id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Placeholder used when a caller supplied no id.
    pub fn unknown() -> Self {
        Self("-".to_string())
    }

    /// Return the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Number of cores available to this process, never less than one.
///
/// Used to size blocking pools in both processes.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_generate_is_unique() {
        let a = TraceId::generate();
        let b = TraceId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_trace_id_display_matches_inner() {
        let id = TraceId::new("req-abc-123");
        assert_eq!(id.to_string(), "req-abc-123");
        assert_eq!(TraceId::unknown().as_str(), "-");
    }

    #[test]
    fn test_available_cores_is_positive() {
        assert!(available_cores() >= 1);
    }

    #[test]
    fn test_gateway_error_other_display() {
        let err = GatewayError::Other("worker binary not found".to_string());
        assert!(err.to_string().contains("worker binary not found"));
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
