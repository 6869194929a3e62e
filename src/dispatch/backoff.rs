//! Reconnect backoff.
//!
//! Bounded exponential backoff with optional jitter, used by the dispatch
//! client between failed connection attempts. The client never retries a
//! call; backoff only spaces out reconnects.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff state.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    /// Backoff doubling from `initial` up to `max`, without jitter.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: 2.0,
            jitter: 0.0,
            attempt: 0,
        }
    }

    /// Add up to `fraction` of each delay as random jitter (clamped to `[0, 1]`).
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        self.attempt = self.attempt.saturating_add(1);

        let base_ms = self.initial.as_millis() as f64 * self.multiplier.powi(exp);
        let max_ms = self.max.as_millis() as f64;
        let capped = base_ms.min(max_ms);
        let delay = Duration::from_millis(capped as u64);

        if self.jitter > 0.0 && capped >= 1.0 {
            let extra = rand::thread_rng().gen_range(0.0..=capped * self.jitter);
            (delay + Duration::from_millis(extra as u64)).min(self.max)
        } else {
            delay
        }
    }

    /// Forget past failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
