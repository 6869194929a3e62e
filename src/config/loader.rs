//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`GatewayConfig`], and run
//! validation before returning.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message

use std::path::Path;

use super::validation::{self, ConfigError};
use super::GatewayConfig;

/// Load a [`GatewayConfig`] from a TOML file.
///
/// # Errors
///
/// - `ConfigError::Io` if the file cannot be read.
/// - `ConfigError::Parse` if the TOML is malformed.
/// - `ConfigError::Validation` if semantic constraints are violated.
pub fn load_from_file(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`GatewayConfig`] from a TOML string.
///
/// `source_name` identifies the source in error messages.
///
/// # Errors
///
/// - `ConfigError::Parse` if the TOML is malformed.
/// - `ConfigError::Validation` if semantic constraints are violated.
pub fn load_from_str(content: &str, source_name: &str) -> Result<GatewayConfig, ConfigError> {
    let config: GatewayConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}

/// Load from `path` when given, otherwise fall back to validated defaults.
///
/// # Errors
///
/// Same as [`load_from_file`].
pub fn load_or_default(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    match path {
        Some(path) => load_from_file(path),
        None => load_from_str("", "<defaults>"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[service]
name = "test-gateway"

[worker]
port = 6001
shutdown_grace_ms = 1500

[batching]
max_batch_size = 16
max_wait_ms = 25

[circuit_breaker]
failure_threshold = 4
recovery_timeout_ms = 1000
half_open_max_calls = 2
"#;

    #[test]
    fn test_load_from_str_valid_toml_succeeds() {
        let config = load_from_str(VALID_TOML, "test").expect("test: valid config");
        assert_eq!(config.service.name, "test-gateway");
        assert_eq!(config.worker.port, 6001);
        assert_eq!(config.batching.max_batch_size, 16);
        assert_eq!(config.circuit_breaker.half_open_max_calls, 2);
        // Untouched sections keep their defaults.
        assert_eq!(config.degradation.failure_threshold, 3);
    }

    #[test]
    fn test_load_from_str_empty_yields_defaults() {
        let config = load_from_str("", "empty").expect("test: empty config");
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn test_load_from_str_invalid_toml_returns_parse_error() {
        let result = load_from_str("not valid toml [[[", "bad.toml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_from_str_validation_failure_returns_validation_error() {
        let toml_str = r#"
[worker]
host = "192.168.1.10"
"#;
        let result = load_from_str(toml_str, "remote.toml");
        match result {
            Err(ConfigError::Validation(msg)) => assert!(msg.contains("worker.host")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file_round_trips_through_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("test: temp file");
        file.write_all(VALID_TOML.as_bytes())
            .expect("test: write config");
        let config = load_from_file(file.path()).expect("test: load from file");
        assert_eq!(config.batching.max_wait_ms, 25);
    }

    #[test]
    fn test_load_from_file_missing_returns_io_error() {
        let result = load_from_file(Path::new("/nonexistent/gateway.toml"));
        match result {
            Err(ConfigError::Io { file, .. }) => assert!(file.contains("gateway.toml")),
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_or_default_without_path() {
        let config = load_or_default(None).expect("test: defaults");
        assert_eq!(config.worker.port, 50051);
    }
}
