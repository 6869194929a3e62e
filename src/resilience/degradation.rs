//! # Degradation Controller
//!
//! ## Responsibility
//! Track the health of each logical service (`detection`, `ocr`,
//! `transcription`, `vqa`) from call outcomes and decide when a request
//! should be answered with a canned fallback instead of reaching the worker.
//!
//! ## Guarantees
//! - Pure status: a service's status is a function of its consecutive
//!   failures against `failure_threshold` and half of it
//! - Bounded probing: an unavailable service lets exactly one real attempt
//!   through per elapsed `recovery_timeout` window
//! - Independent: knows nothing about circuit breakers
//!
//! ## NOT Responsible For
//! - Building the fallback payloads (see `pipeline::fallback`)
//! - Retrying anything

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::DegradationSection;

/// Services registered when the controller is created.
pub const KNOWN_SERVICES: [&str; 4] = ["detection", "ocr", "transcription", "vqa"];

/// Health of one logical service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Serving normally.
    Healthy,
    /// Failing often, still attempted.
    Degraded,
    /// Answered from fallbacks except for periodic probes.
    Unavailable,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Status implied by a consecutive-failure count.
pub fn status_for(consecutive_failures: u32, failure_threshold: u32) -> ServiceStatus {
    if consecutive_failures >= failure_threshold {
        ServiceStatus::Unavailable
    } else if consecutive_failures > 0 && consecutive_failures >= failure_threshold / 2 {
        ServiceStatus::Degraded
    } else {
        ServiceStatus::Healthy
    }
}

/// Mutable health record of one service.
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    /// Service name.
    pub name: String,
    /// Current status.
    pub status: ServiceStatus,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// When the most recent failure was recorded.
    pub last_failure_time: Option<Instant>,
    /// Wall-clock time of the most recent success.
    pub last_success_time: Option<SystemTime>,
    /// All recorded outcomes.
    pub total_requests: u64,
    /// All recorded failures.
    pub total_failures: u64,
    last_probe_time: Option<Instant>,
}

impl ServiceHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ServiceStatus::Healthy,
            consecutive_failures: 0,
            last_failure_time: None,
            last_success_time: None,
            total_requests: 0,
            total_failures: 0,
            last_probe_time: None,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_requests as f64 * 100.0
        }
    }
}

/// Serializable per-service statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealthSnapshot {
    /// Current status.
    pub status: ServiceStatus,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// All recorded outcomes.
    pub total_requests: u64,
    /// All recorded failures.
    pub total_failures: u64,
    /// Percentage of recorded outcomes that were failures, `0.0..=100.0`.
    pub failure_rate: f64,
}

/// Per-service health tracker and fallback decision point.
///
/// Each entry is guarded by its own shard lock; no lock is held across an
/// await point.
#[derive(Debug)]
pub struct DegradationController {
    services: DashMap<String, ServiceHealth>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl DegradationController {
    /// Create a controller with the four known services registered.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        let services = DashMap::new();
        for name in KNOWN_SERVICES {
            services.insert(name.to_string(), ServiceHealth::new(name));
        }
        Self {
            services,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
        }
    }

    /// Build from the `[degradation]` config section.
    pub fn from_section(section: &DegradationSection) -> Self {
        Self::new(section.failure_threshold, section.recovery_timeout())
    }

    /// Record a successful call; the service becomes healthy.
    pub fn record_success(&self, service: &str) {
        let mut health = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| ServiceHealth::new(service));
        let was = health.status;
        health.consecutive_failures = 0;
        health.last_success_time = Some(SystemTime::now());
        health.total_requests += 1;
        health.status = ServiceStatus::Healthy;
        health.last_probe_time = None;
        if was != ServiceStatus::Healthy {
            info!(service, from = %was, "service recovered to healthy");
        }
    }

    /// Record a failed call and re-derive the status.
    pub fn record_failure(&self, service: &str) {
        let mut health = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| ServiceHealth::new(service));
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.last_failure_time = Some(Instant::now());
        health.total_requests += 1;
        health.total_failures += 1;

        let was = health.status;
        health.status = status_for(health.consecutive_failures, self.failure_threshold);
        if health.status != was {
            warn!(
                service,
                status = %health.status,
                consecutive_failures = health.consecutive_failures,
                "service health changed"
            );
        }
    }

    /// Whether the next request for `service` should get a fallback.
    ///
    /// False unless the service is unavailable. While unavailable, returns
    /// false once per elapsed recovery window so a single probe reaches the
    /// worker, and true otherwise.
    pub fn should_use_fallback(&self, service: &str) -> bool {
        let mut health = self
            .services
            .entry(service.to_string())
            .or_insert_with(|| ServiceHealth::new(service));
        if health.status != ServiceStatus::Unavailable {
            return false;
        }

        let window_start = match (health.last_failure_time, health.last_probe_time) {
            (Some(f), Some(p)) => Some(f.max(p)),
            (f, p) => f.or(p),
        };
        let due = window_start.map_or(true, |t| t.elapsed() >= self.recovery_timeout);
        if due {
            health.last_probe_time = Some(Instant::now());
            info!(service, "attempting recovery probe");
            false
        } else {
            true
        }
    }

    /// Current status of `service`, `Healthy` for unknown names.
    pub fn status(&self, service: &str) -> ServiceStatus {
        self.services
            .get(service)
            .map_or(ServiceStatus::Healthy, |h| h.status)
    }

    /// Clone of the full health record of `service`.
    pub fn health(&self, service: &str) -> Option<ServiceHealth> {
        self.services.get(service).map(|h| h.clone())
    }

    /// Statistics for every tracked service, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<String, ServiceHealthSnapshot> {
        self.services
            .iter()
            .map(|entry| {
                let h = entry.value();
                (
                    entry.key().clone(),
                    ServiceHealthSnapshot {
                        status: h.status,
                        consecutive_failures: h.consecutive_failures,
                        total_requests: h.total_requests,
                        total_failures: h.total_failures,
                        failure_rate: h.failure_rate(),
                    },
                )
            })
            .collect()
    }
}

impl Default for DegradationController {
    fn default() -> Self {
        Self::from_section(&DegradationSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_pure_function_of_failures() {
        assert_eq!(status_for(0, 4), ServiceStatus::Healthy);
        assert_eq!(status_for(1, 4), ServiceStatus::Healthy);
        assert_eq!(status_for(2, 4), ServiceStatus::Degraded);
        assert_eq!(status_for(3, 4), ServiceStatus::Degraded);
        assert_eq!(status_for(4, 4), ServiceStatus::Unavailable);
        // threshold 1: floor(1/2) = 0 never degrades on zero failures
        assert_eq!(status_for(0, 1), ServiceStatus::Healthy);
        assert_eq!(status_for(1, 1), ServiceStatus::Unavailable);
    }

    #[test]
    fn test_known_services_registered_up_front() {
        let c = DegradationController::default();
        let snap = c.snapshot();
        for name in KNOWN_SERVICES {
            assert_eq!(snap[name].status, ServiceStatus::Healthy);
        }
    }

    #[test]
    fn test_threshold_four_transitions() {
        let c = DegradationController::new(4, Duration::from_secs(60));
        c.record_failure("ocr");
        assert_eq!(c.status("ocr"), ServiceStatus::Healthy);
        c.record_failure("ocr");
        assert_eq!(c.status("ocr"), ServiceStatus::Degraded);
        c.record_failure("ocr");
        c.record_failure("ocr");
        assert_eq!(c.status("ocr"), ServiceStatus::Unavailable);

        c.record_success("ocr");
        let h = c.health("ocr").expect("test: ocr tracked");
        assert_eq!(h.status, ServiceStatus::Healthy);
        assert_eq!(h.consecutive_failures, 0);
        assert_eq!(h.total_requests, 5);
        assert_eq!(h.total_failures, 4);
    }

    #[test]
    fn test_unknown_service_created_on_first_use() {
        let c = DegradationController::default();
        assert!(!c.should_use_fallback("captioning"));
        c.record_failure("captioning");
        assert!(c.snapshot().contains_key("captioning"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_allows_one_probe_per_window() {
        let c = DegradationController::new(2, Duration::from_secs(60));
        assert!(!c.should_use_fallback("vqa"));
        c.record_failure("vqa");
        c.record_failure("vqa");
        assert_eq!(c.status("vqa"), ServiceStatus::Unavailable);
        assert!(c.should_use_fallback("vqa"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!c.should_use_fallback("vqa"), "first call after window probes");
        assert!(c.should_use_fallback("vqa"), "second call in same window falls back");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!c.should_use_fallback("vqa"), "next window probes again");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_restarts_window() {
        let c = DegradationController::new(1, Duration::from_secs(10));
        c.record_failure("detection");
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!c.should_use_fallback("detection"));
        c.record_failure("detection");
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(c.should_use_fallback("detection"));
    }

    #[test]
    fn test_failure_rate_is_percentage() {
        let c = DegradationController::new(10, Duration::from_secs(60));
        c.record_success("transcription");
        c.record_failure("transcription");
        c.record_success("transcription");
        c.record_failure("transcription");
        let snap = c.snapshot();
        assert!((snap["transcription"].failure_rate - 50.0).abs() < 1e-9);
        let json = serde_json::to_value(&snap["transcription"]).expect("test: serialize");
        assert_eq!(json["status"], "healthy");
    }
}
