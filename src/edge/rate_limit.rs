//! Per-client rate limiting.
//!
//! One `governor` limiter per client id. A client may burst up to
//! `max_requests` requests, and capacity comes back at `max_requests` per
//! `window`, so a client that keeps to the quota is never rejected.
//!
//! ## Usage
//!
//! ```
//! use std::time::Duration;
//! use tokio_inference_gateway::edge::RateLimiter;
//!
//! let limiter = RateLimiter::new(2, Duration::from_secs(60));
//! assert!(limiter.check("10.0.0.7"));
//! assert!(limiter.check("10.0.0.7"));
//! assert!(!limiter.check("10.0.0.7"));
//! ```

use dashmap::DashMap;
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RateLimitSection;

type ClientLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct ClientState {
    limiter: ClientLimiter,
    /// Burst capacity left right after the last check.
    remaining: u32,
    last_check: Instant,
}

struct Limits {
    clients: DashMap<String, ClientState>,
    /// `None` when the quota is zero: every request is rejected.
    quota: Option<Quota>,
    burst: u32,
    replenish: Duration,
    clock: DefaultClock,
}

impl Limits {
    /// Time until `state` has its whole burst back.
    fn refill_left(&self, state: &ClientState) -> Duration {
        let deficit = self.burst.saturating_sub(state.remaining);
        self.replenish
            .saturating_mul(deficit)
            .saturating_sub(state.last_check.elapsed())
    }

    /// Burst capacity `state` has spent and not yet regained.
    fn spent(&self, state: &ClientState) -> u32 {
        let period = self.replenish.as_nanos().max(1);
        u32::try_from(self.refill_left(state).as_nanos().div_ceil(period))
            .unwrap_or(u32::MAX)
            .min(self.burst)
    }
}

/// Usage of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    /// Burst capacity currently spent.
    pub used: usize,
    /// Requests that would be admitted right now.
    pub remaining: usize,
    /// Seconds until the full burst is available again.
    pub reset_in_secs: u64,
}

/// Limiter keyed by client id. Cheap to clone.
#[derive(Clone)]
pub struct RateLimiter {
    limits: Option<Arc<Limits>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.limits {
            Some(limits) => f
                .debug_struct("RateLimiter")
                .field("burst", &limits.burst)
                .field("replenish", &limits.replenish)
                .field("clients", &limits.clients.len())
                .finish(),
            None => f.write_str("RateLimiter(unlimited)"),
        }
    }
}

impl RateLimiter {
    /// Allow `max_requests` per `window` per client. A zero quota rejects
    /// every request.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        let burst = u32::try_from(max_requests).unwrap_or(u32::MAX);
        let replenish = if burst == 0 {
            window
        } else {
            window / burst
        };
        let quota = NonZeroU32::new(burst).map(|n| {
            Quota::with_period(replenish)
                .unwrap_or_else(|| Quota::per_second(n))
                .allow_burst(n)
        });
        Self {
            limits: Some(Arc::new(Limits {
                clients: DashMap::new(),
                quota,
                burst,
                replenish,
                clock: DefaultClock::default(),
            })),
        }
    }

    /// A limiter that admits everything.
    pub fn unlimited() -> Self {
        Self { limits: None }
    }

    /// Build from the `[rate_limit]` section.
    pub fn from_section(section: &RateLimitSection) -> Self {
        if section.enabled {
            Self::new(section.requests, Duration::from_secs(section.window_s))
        } else {
            Self::unlimited()
        }
    }

    /// Count one request from `client`; `false` if it exceeds the limit.
    pub fn check(&self, client: &str) -> bool {
        let Some(limits) = &self.limits else {
            return true;
        };
        let Some(quota) = limits.quota else {
            warn!(client, limit = 0, "rate limit exceeded");
            return false;
        };
        let mut state = limits
            .clients
            .entry(client.to_string())
            .or_insert_with(|| ClientState {
                limiter: GovernorRateLimiter::direct(quota),
                remaining: limits.burst,
                last_check: Instant::now(),
            });
        let spent = limits.spent(&state);
        state.last_check = Instant::now();
        match state.limiter.check() {
            Ok(()) => {
                state.remaining = limits.burst.saturating_sub(spent.saturating_add(1));
                debug!(client, remaining = state.remaining, "rate limit check passed");
                true
            }
            Err(not_until) => {
                state.remaining = 0;
                let retry_after = not_until.wait_time_from(limits.clock.now());
                warn!(
                    client,
                    limit = limits.burst,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "rate limit exceeded"
                );
                false
            }
        }
    }

    /// Forget `client`'s limiter, restoring its full burst.
    pub fn reset(&self, client: &str) {
        if let Some(limits) = &self.limits {
            limits.clients.remove(client);
            debug!(client, "rate limit reset");
        }
    }

    /// Estimated usage of `client`, if it has made requests.
    pub fn usage(&self, client: &str) -> Option<RateLimitInfo> {
        let limits = self.limits.as_ref()?;
        let state = limits.clients.get(client)?;
        let used = limits.spent(&state);
        Some(RateLimitInfo {
            used: used as usize,
            remaining: limits.burst.saturating_sub(used) as usize,
            reset_in_secs: limits.refill_left(&state).as_secs(),
        })
    }

    /// Drop limiters of clients whose burst has fully recovered.
    pub fn sweep(&self) {
        if let Some(limits) = &self.limits {
            limits
                .clients
                .retain(|_, state| !limits.refill_left(state).is_zero());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_is_per_client() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }

    #[test]
    fn test_usage_tracks_spent_burst() {
        let limiter = RateLimiter::new(10, Duration::from_secs(60));
        assert!(limiter.usage("a").is_none());
        limiter.check("a");
        limiter.check("a");
        let info = limiter.usage("a").expect("test: usage");
        assert_eq!((info.used, info.remaining), (2, 8));
        assert!(info.reset_in_secs <= 12);
    }

    #[tokio::test]
    async fn test_capacity_comes_back_over_the_window() {
        let limiter = RateLimiter::new(2, Duration::from_millis(200));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(limiter.check("a"));
    }

    #[tokio::test]
    async fn test_sweep_drops_recovered_clients() {
        let limiter = RateLimiter::new(5, Duration::from_millis(100));
        limiter.check("a");
        limiter.check("b");
        for _ in 0..5 {
            limiter.check("b");
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        limiter.sweep();
        assert!(limiter.usage("a").is_none());
        assert!(limiter.usage("b").is_some());
    }

    #[test]
    fn test_zero_quota_rejects_everything() {
        let limiter = RateLimiter::new(0, Duration::from_secs(60));
        assert!(!limiter.check("a"));
        assert!(limiter.usage("a").is_none());
    }

    #[test]
    fn test_unlimited_and_reset() {
        let open = RateLimiter::unlimited();
        for _ in 0..100 {
            assert!(open.check("x"));
        }
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("x"));
        assert!(!limiter.check("x"));
        limiter.reset("x");
        assert!(limiter.check("x"));
    }
}
