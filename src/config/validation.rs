//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`GatewayConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
//! invariants, loopback-only worker placement).
//!
//! ## Guarantees
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::GatewayConfig;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "batching.max_batch_size").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Whether `host` names the loopback interface.
pub fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Validate all semantic constraints on a [`GatewayConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Errors
///
/// Returns `Err(Vec<ConfigError>)` with every violation found.
pub fn validate(config: &GatewayConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Service ──────────────────────────────────────────────────────
    if config.service.name.trim().is_empty() {
        errors.push(invalid("service.name", "\"\"", "must not be empty"));
    }

    // ── Worker ───────────────────────────────────────────────────────
    if !is_loopback_host(&config.worker.host) {
        errors.push(invalid(
            "worker.host",
            &config.worker.host,
            "worker is reachable only over loopback",
        ));
    }
    if config.worker.startup_timeout_ms == 0 {
        errors.push(invalid("worker.startup_timeout_ms", 0, "must be at least 1"));
    }
    if config.worker.liveness_interval_ms == 0 {
        errors.push(invalid("worker.liveness_interval_ms", 0, "must be at least 1"));
    }
    if config.worker.model_threads == Some(0) {
        errors.push(invalid("worker.model_threads", 0, "must be at least 1"));
    }

    // ── Channel ──────────────────────────────────────────────────────
    if config.channel.max_message_bytes < 1024 {
        errors.push(invalid(
            "channel.max_message_bytes",
            config.channel.max_message_bytes,
            "must be at least 1024",
        ));
    }
    if config.channel.reconnect_initial_ms > config.channel.reconnect_max_ms {
        errors.push(invalid(
            "channel.reconnect_initial_ms",
            config.channel.reconnect_initial_ms,
            "must be \u{2264} reconnect_max_ms",
        ));
    }
    if config.channel.call_timeout_ms == 0 {
        errors.push(invalid("channel.call_timeout_ms", 0, "must be at least 1"));
    }
    if config.channel.connect_timeout_ms == 0 {
        errors.push(invalid("channel.connect_timeout_ms", 0, "must be at least 1"));
    }
    if config.channel.keepalive_interval_ms == 0 {
        errors.push(invalid("channel.keepalive_interval_ms", 0, "must be at least 1"));
    }
    if config.channel.keepalive_timeout_ms == 0 {
        errors.push(invalid("channel.keepalive_timeout_ms", 0, "must be at least 1"));
    }
    let largest_payload = config
        .buffer_pool
        .image_buffer_bytes
        .max(config.buffer_pool.audio_buffer_bytes);
    if largest_payload >= config.channel.max_message_bytes {
        errors.push(invalid(
            "channel.max_message_bytes",
            config.channel.max_message_bytes,
            "must exceed the largest accepted payload",
        ));
    }

    // ── Batching ─────────────────────────────────────────────────────
    if config.batching.max_batch_size == 0 {
        errors.push(invalid("batching.max_batch_size", 0, "must be at least 1"));
    }

    // ── Circuit breaker ──────────────────────────────────────────────
    if config.circuit_breaker.failure_threshold == 0 {
        errors.push(invalid(
            "circuit_breaker.failure_threshold",
            0,
            "must be at least 1",
        ));
    }
    if config.circuit_breaker.half_open_max_calls == 0 {
        errors.push(invalid(
            "circuit_breaker.half_open_max_calls",
            0,
            "must be at least 1",
        ));
    }

    // ── Degradation ──────────────────────────────────────────────────
    if config.degradation.failure_threshold == 0 {
        errors.push(invalid("degradation.failure_threshold", 0, "must be at least 1"));
    }

    // ── Buffer pools ─────────────────────────────────────────────────
    if config.buffer_pool.image_buffer_bytes == 0 {
        errors.push(invalid("buffer_pool.image_buffer_bytes", 0, "must be at least 1"));
    }
    if config.buffer_pool.audio_buffer_bytes == 0 {
        errors.push(invalid("buffer_pool.audio_buffer_bytes", 0, "must be at least 1"));
    }

    // ── Rate limit ───────────────────────────────────────────────────
    if config.rate_limit.enabled && config.rate_limit.window_s == 0 {
        errors.push(invalid("rate_limit.window_s", 0, "must be at least 1 second"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn test_loopback_hosts_recognised() {
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("::1"));
        assert!(is_loopback_host("[::1]"));
        assert!(is_loopback_host("localhost"));
        assert!(!is_loopback_host("0.0.0.0"));
        assert!(!is_loopback_host("10.0.0.7"));
        assert!(!is_loopback_host("worker.internal"));
    }

    #[test]
    fn test_non_loopback_worker_host_rejected() {
        let mut config = GatewayConfig::default();
        config.worker.host = "0.0.0.0".into();
        let errors = validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.to_string().contains("worker.host")));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = GatewayConfig::default();
        config.batching.max_batch_size = 0;
        config.circuit_breaker.failure_threshold = 0;
        config.degradation.failure_threshold = 0;
        config.channel.reconnect_initial_ms = 10_000;
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_payload_limit_must_fit_in_frame() {
        let mut config = GatewayConfig::default();
        config.channel.max_message_bytes = 4096;
        config.buffer_pool.audio_buffer_bytes = 8192;
        config.buffer_pool.image_buffer_bytes = 2048;
        let errors = validate(&config).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("largest accepted payload")));
    }

    #[test]
    fn test_zero_rate_window_ignored_when_disabled() {
        let mut config = GatewayConfig::default();
        config.rate_limit.enabled = false;
        config.rate_limit.window_s = 0;
        assert!(validate(&config).is_ok());
    }
}
