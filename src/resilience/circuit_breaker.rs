//! Circuit Breaker
//!
//! Stops calling a dependency that keeps failing, then probes it again after
//! a recovery timeout.
//!
//! ## States
//! - **Closed**: Normal operation, calls flow through
//! - **Open**: Dependency failing, calls rejected immediately
//! - **Half-Open**: A bounded number of probe calls test recovery
//!
//! ## Transitions
//! - Closed → Open when consecutive failures reach `failure_threshold`
//! - Open → Half-Open once `recovery_timeout` has elapsed since the last failure
//! - Half-Open → Closed on a successful probe
//! - Half-Open → Open on any failed probe
//! - A probe whose caller goes away before it finishes gives its slot back
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio_inference_gateway::resilience::circuit_breaker::{
//!     CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
//! };
//! # #[tokio::main]
//! # async fn main() {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::new("detection"));
//!
//! match breaker.execute(|| async { Ok::<&str, &str>("objects") }).await {
//!     Ok(result) => println!("{result}"),
//!     Err(CircuitBreakerError::Open { name }) => eprintln!("{name} is open, failing fast"),
//!     Err(CircuitBreakerError::Failed(e)) => eprintln!("call failed: {e}"),
//! }
//! # }
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tuning for a single breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name of the guarded dependency, used in logs and errors.
    pub name: String,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: usize,
    /// How long the circuit stays open before admitting probes.
    pub recovery_timeout: Duration,
    /// Maximum probes admitted while half-open.
    pub half_open_max_calls: usize,
}

impl CircuitBreakerConfig {
    /// Config with the default thresholds (5 failures, 30 s, 3 probes).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }

    /// Build from the `[circuit_breaker]` config section.
    pub fn from_section(
        name: impl Into<String>,
        section: &crate::config::CircuitBreakerSection,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: section.failure_threshold,
            recovery_timeout: section.recovery_timeout(),
            half_open_max_calls: section.half_open_max_calls,
        }
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Calls flow through normally.
    Closed,
    /// Calls are rejected without invoking the operation.
    Open,
    /// A bounded number of probe calls are let through.
    HalfOpen,
}

/// Errors returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit rejected the call before it was attempted.
    #[error("circuit breaker '{name}' is open")]
    Open {
        /// Name of the breaker that rejected the call.
        name: String,
    },
    /// The operation ran and failed.
    #[error("operation failed: {0}")]
    Failed(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was rejected without being attempted.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    failures: usize,
    last_failure_time: Option<Instant>,
    half_open_calls: usize,
    /// Bumped on every Open → Half-Open transition.
    half_open_episode: u64,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitStatus,
    /// Consecutive failures.
    pub failure_count: usize,
    /// Failures needed to open.
    pub failure_threshold: usize,
    /// Probes admitted in the current half-open episode.
    pub half_open_calls: usize,
}

/// Circuit breaker guarding one external dependency.
///
/// Cheap to clone; clones share state. The state lock is never held across
/// an await point.
#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<CircuitState>>,
    config: Arc<CircuitBreakerConfig>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("status", &self.status())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(CircuitState {
                status: CircuitStatus::Closed,
                failures: 0,
                last_failure_time: None,
                half_open_calls: 0,
                half_open_episode: 0,
            })),
            config: Arc::new(config),
        }
    }

    /// Name of the guarded dependency.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Move Open → Half-Open if the recovery timeout has elapsed.
    fn maybe_half_open(&self, state: &mut CircuitState) {
        if state.status != CircuitStatus::Open {
            return;
        }
        let elapsed = state
            .last_failure_time
            .map_or(true, |t| t.elapsed() >= self.config.recovery_timeout);
        if elapsed {
            state.status = CircuitStatus::HalfOpen;
            state.half_open_calls = 0;
            state.half_open_episode += 1;
            info!(breaker = %self.config.name, "circuit breaker: transitioning to half-open");
        }
    }

    /// Whether a call would currently be admitted.
    ///
    /// Performs the Open → Half-Open transition once the recovery timeout
    /// has elapsed. Does not reserve a probe slot.
    pub fn can_execute(&self) -> bool {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);
        match state.status {
            CircuitStatus::Closed => true,
            CircuitStatus::Open => false,
            CircuitStatus::HalfOpen => state.half_open_calls < self.config.half_open_max_calls,
        }
    }

    /// Admit a call, reserving a probe slot when half-open.
    fn try_acquire(&self) -> Option<Admission<'_>> {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);
        match state.status {
            CircuitStatus::Closed => Some(Admission {
                breaker: self,
                probe_episode: None,
            }),
            CircuitStatus::Open => None,
            CircuitStatus::HalfOpen => {
                if state.half_open_calls < self.config.half_open_max_calls {
                    state.half_open_calls += 1;
                    Some(Admission {
                        breaker: self,
                        probe_episode: Some(state.half_open_episode),
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Return an unused probe slot, if its half-open episode is still current.
    fn release_probe(&self, episode: u64) {
        let mut state = self.state.lock();
        if state.status == CircuitStatus::HalfOpen
            && state.half_open_episode == episode
            && state.half_open_calls > 0
        {
            state.half_open_calls -= 1;
            debug!(
                breaker = %self.config.name,
                half_open_calls = state.half_open_calls,
                "circuit breaker: probe abandoned, slot released"
            );
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.status == CircuitStatus::HalfOpen {
            state.status = CircuitStatus::Closed;
            state.half_open_calls = 0;
            info!(breaker = %self.config.name, "circuit breaker: closing (dependency recovered)");
        }
        state.failures = 0;
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failures += 1;
        state.last_failure_time = Some(Instant::now());

        match state.status {
            CircuitStatus::HalfOpen => {
                state.status = CircuitStatus::Open;
                warn!(breaker = %self.config.name, "circuit breaker: reopening (probe failed)");
            }
            CircuitStatus::Closed if state.failures >= self.config.failure_threshold => {
                state.status = CircuitStatus::Open;
                warn!(
                    breaker = %self.config.name,
                    failures = state.failures,
                    threshold = self.config.failure_threshold,
                    "circuit breaker: opening (threshold reached)"
                );
            }
            _ => {
                debug!(
                    breaker = %self.config.name,
                    failures = state.failures,
                    "circuit breaker: failure recorded"
                );
            }
        }
    }

    /// Run `f` through the breaker.
    ///
    /// Rejected calls return [`CircuitBreakerError::Open`] without invoking
    /// `f` and without counting as a failure.
    ///
    /// # Errors
    ///
    /// `Open` when rejected, `Failed(e)` when `f` returned `Err(e)`.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(mut admission) = self.try_acquire() else {
            debug!(breaker = %self.config.name, "circuit breaker: call rejected (open)");
            return Err(CircuitBreakerError::Open {
                name: self.config.name.clone(),
            });
        };

        let result = f().await;
        admission.settle();
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result.map_err(CircuitBreakerError::Failed)
    }

    /// Current state, applying a due Open → Half-Open transition first.
    pub fn status(&self) -> CircuitStatus {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);
        state.status
    }

    /// Point-in-time snapshot.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);
        CircuitBreakerSnapshot {
            name: self.config.name.clone(),
            state: state.status,
            failure_count: state.failures,
            failure_threshold: self.config.failure_threshold,
            half_open_calls: state.half_open_calls,
        }
    }

    /// Manually close the circuit.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.status = CircuitStatus::Closed;
        state.failures = 0;
        state.half_open_calls = 0;
        state.last_failure_time = None;
        info!(breaker = %self.config.name, "circuit breaker: manually reset to closed");
    }

    /// Manually open the circuit, as if a failure had just happened.
    pub fn trip(&self) {
        let mut state = self.state.lock();
        state.status = CircuitStatus::Open;
        state.last_failure_time = Some(Instant::now());
        warn!(breaker = %self.config.name, "circuit breaker: manually tripped to open");
    }
}

/// A call admitted by [`CircuitBreaker::execute`].
///
/// Dropping it before [`Admission::settle`] (the `execute` future was
/// cancelled) hands a half-open probe slot back to the breaker.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    probe_episode: Option<u64>,
}

impl Admission<'_> {
    /// The call finished; its outcome is about to be recorded.
    fn settle(&mut self) {
        self.probe_episode = None;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if let Some(episode) = self.probe_episode.take() {
            self.breaker.release_probe(episode);
        }
    }
}
