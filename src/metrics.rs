//! Prometheus metrics for the gateway and the worker.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_request`, `observe_batch_size`, …) are no-ops if `init_metrics` was
//! never called, so library code is always safe to run and observability
//! simply degrades.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `gateway_requests_total` | Counter | `service`, `outcome` |
//! | `gateway_fallbacks_total` | Counter | `service` |
//! | `gateway_batch_size` | Histogram | `batcher` |
//! | `gateway_dispatch_duration_seconds` | Histogram | `method` |
//! | `gateway_pool_fallbacks_total` | Counter | `pool` |
//!
//! There is no HTTP exposition endpoint; [`gather_text`] renders the text
//! format for whoever wants to ship it.

use crate::GatewayError;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;
use std::time::Duration;

/// All Prometheus metrics for the gateway, stored in a single [`OnceLock`].
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Requests per service and outcome (`success`, `cached`, `fallback`, error kind).
    pub requests_total: CounterVec,
    /// Canned fallback responses served per service.
    pub fallbacks_total: CounterVec,
    /// Items per flushed batch.
    pub batch_size: HistogramVec,
    /// Round-trip latency of dispatch calls per method.
    pub dispatch_duration: HistogramVec,
    /// Pool acquisitions served by an unpooled buffer.
    pub pool_fallbacks: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn build_err(e: prometheus::Error) -> GatewayError {
    GatewayError::Other(format!("metrics init failed: {e}"))
}

/// Build a metrics bundle on a fresh registry with every name prefixed.
fn build(prefix: &str) -> Result<Metrics, GatewayError> {
    let registry = Registry::new();

    let requests_total = CounterVec::new(
        Opts::new(
            format!("{prefix}_requests_total"),
            "Requests handled by the pipeline",
        ),
        &["service", "outcome"],
    )
    .map_err(build_err)?;
    registry
        .register(Box::new(requests_total.clone()))
        .map_err(build_err)?;

    let fallbacks_total = CounterVec::new(
        Opts::new(
            format!("{prefix}_fallbacks_total"),
            "Fallback responses served while a service is unavailable",
        ),
        &["service"],
    )
    .map_err(build_err)?;
    registry
        .register(Box::new(fallbacks_total.clone()))
        .map_err(build_err)?;

    let batch_size = HistogramVec::new(
        HistogramOpts::new(format!("{prefix}_batch_size"), "Items per flushed batch")
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]),
        &["batcher"],
    )
    .map_err(build_err)?;
    registry
        .register(Box::new(batch_size.clone()))
        .map_err(build_err)?;

    let dispatch_duration = HistogramVec::new(
        HistogramOpts::new(
            format!("{prefix}_dispatch_duration_seconds"),
            "Round-trip latency of worker calls",
        ),
        &["method"],
    )
    .map_err(build_err)?;
    registry
        .register(Box::new(dispatch_duration.clone()))
        .map_err(build_err)?;

    let pool_fallbacks = CounterVec::new(
        Opts::new(
            format!("{prefix}_pool_fallbacks_total"),
            "Buffer acquisitions that fell back to an unpooled buffer",
        ),
        &["pool"],
    )
    .map_err(build_err)?;
    registry
        .register(Box::new(pool_fallbacks.clone()))
        .map_err(build_err)?;

    Ok(Metrics {
        registry,
        requests_total,
        fallbacks_total,
        batch_size,
        dispatch_duration,
        pool_fallbacks,
    })
}

/// Initialise all metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`GatewayError::Other`] if metric construction or registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), GatewayError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = build("gateway")?;
    // First initialiser wins; descriptors are identical either way.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Count one finished request for `service` with the given outcome label.
pub fn inc_request(service: &str, outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .requests_total
            .get_metric_with_label_values(&[service, outcome])
        {
            c.inc();
        }
    }
}

/// Count one fallback response for `service`.
pub fn inc_fallback(service: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.fallbacks_total.get_metric_with_label_values(&[service]) {
            c.inc();
        }
    }
}

/// Record the size of a flushed batch.
pub fn observe_batch_size(batcher: &str, size: usize) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.batch_size.get_metric_with_label_values(&[batcher]) {
            h.observe(size as f64);
        }
    }
}

/// Record the round-trip latency of one dispatch call.
pub fn observe_dispatch(method: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.dispatch_duration.get_metric_with_label_values(&[method]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Count one unpooled fallback acquisition on `pool`.
pub fn inc_pool_fallback(pool: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.pool_fallbacks.get_metric_with_label_values(&[pool]) {
            c.inc();
        }
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_text() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    encode(&m.registry)
}

fn encode(registry: &Registry) -> String {
    let families = registry.gather();
    if families.is_empty() {
        return String::new();
    }
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global OnceLock cannot be reset between tests, so exact-value
    // assertions use an isolated bundle.

    #[test]
    fn test_init_metrics_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok(), "second call must be a no-op");
    }

    #[test]
    fn test_helpers_before_or_after_init_do_not_panic() {
        inc_request("detection", "success");
        inc_fallback("ocr");
        observe_batch_size("detection", 3);
        observe_dispatch("DetectObjects", Duration::from_millis(4));
        inc_pool_fallback("image");
        let _ = gather_text();
    }

    #[test]
    fn test_request_counter_labels_in_isolated_bundle() {
        let m = build("t1").expect("test: build bundle");
        let c = m
            .requests_total
            .get_metric_with_label_values(&["vqa", "fallback"])
            .expect("test: labels");
        c.inc();
        c.inc();
        let text = encode(&m.registry);
        assert!(text.contains("t1_requests_total{outcome=\"fallback\",service=\"vqa\"} 2"));
    }

    #[test]
    fn test_batch_size_histogram_counts_observations() {
        let m = build("t2").expect("test: build bundle");
        let h = m
            .batch_size
            .get_metric_with_label_values(&["detection"])
            .expect("test: labels");
        h.observe(8.0);
        h.observe(3.0);
        let families = m.registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == "t2_batch_size")
            .expect("test: histogram family present");
        assert_eq!(family.get_metric()[0].get_histogram().get_sample_count(), 2);
    }

    #[test]
    fn test_gather_text_after_observation_mentions_metric() {
        let _ = init_metrics();
        inc_pool_fallback("audio");
        let text = gather_text();
        assert!(text.contains("gateway_pool_fallbacks_total"));
    }
}
