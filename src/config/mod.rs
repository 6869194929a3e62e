//! # Gateway Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML configuration shared by the gateway and the
//! worker binary. Every section and field has a documented default, so an
//! empty file (or no file at all) yields a working configuration.
//!
//! ```text
//! cargo run --bin inference-gateway -- --config gateway.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `GatewayConfig`
//! - Validated: semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building runtime objects from config (that belongs to `pipeline` and `worker`)
//! - Hot reload (configuration is read once at process start)

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MIB: usize = 1024 * 1024;

// ── Default value functions ──────────────────────────────────────────────

fn default_service_name() -> String {
    "inference-gateway".to_string()
}

fn default_service_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_worker_host() -> String {
    "127.0.0.1".to_string()
}

/// Default worker port, the fixed loopback port of the worker.
fn default_worker_port() -> u16 {
    50051
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

/// Default shutdown grace period: 5 seconds for in-flight calls to finish.
fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_liveness_interval_ms() -> u64 {
    1_000
}

/// Default maximum frame size: 64 MiB, enough for the largest audio upload.
fn default_max_message_bytes() -> usize {
    64 * MIB
}

fn default_keepalive_interval_ms() -> u64 {
    10_000
}

fn default_keepalive_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_initial_ms() -> u64 {
    100
}

fn default_reconnect_max_ms() -> u64 {
    5_000
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

/// Default per-call timeout: 120 seconds.
fn default_call_timeout_ms() -> u64 {
    120_000
}

fn default_max_batch_size() -> usize {
    8
}

fn default_max_wait_ms() -> u64 {
    50
}

fn default_breaker_threshold() -> usize {
    5
}

fn default_breaker_recovery_ms() -> u64 {
    30_000
}

fn default_half_open_max_calls() -> usize {
    3
}

fn default_degradation_threshold() -> u32 {
    3
}

fn default_degradation_recovery_ms() -> u64 {
    60_000
}

fn default_image_buffer_bytes() -> usize {
    10 * MIB
}

fn default_audio_buffer_bytes() -> usize {
    25 * MIB
}

fn default_image_pool_size() -> usize {
    4
}

fn default_audio_pool_size() -> usize {
    2
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_ttl_detection_s() -> u64 {
    3_600
}

fn default_ttl_ocr_s() -> u64 {
    7_200
}

fn default_ttl_transcription_s() -> u64 {
    1_800
}

fn default_ttl_vqa_s() -> u64 {
    86_400
}

fn default_rate_limit_requests() -> usize {
    10
}

fn default_rate_limit_window_s() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a gateway instance and its worker.
///
/// # Example
///
/// ```toml
/// [service]
/// name = "production"
///
/// [batching]
/// max_batch_size = 16
/// max_wait_ms = 25
///
/// [circuit_breaker]
/// failure_threshold = 5
/// recovery_timeout_ms = 30000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct GatewayConfig {
    /// Service identity metadata.
    #[serde(default)]
    pub service: ServiceSection,
    /// Worker process placement and lifecycle.
    #[serde(default)]
    pub worker: WorkerSection,
    /// Cross-process channel tuning.
    #[serde(default)]
    pub channel: ChannelSection,
    /// Dynamic batching of detection requests.
    #[serde(default)]
    pub batching: BatchingSection,
    /// Per-capability circuit breakers.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,
    /// Per-service degradation thresholds.
    #[serde(default)]
    pub degradation: DegradationSection,
    /// Worker-side buffer pools.
    #[serde(default)]
    pub buffer_pool: BufferPoolSection,
    /// Result cache.
    #[serde(default)]
    pub cache: CacheSection,
    /// Per-client rate limiting.
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    /// Scheduler sizing.
    #[serde(default)]
    pub runtime: RuntimeSection,
}

/// Service identity metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServiceSection {
    /// Human-readable service name used in logs.
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Version string reported in status output.
    #[serde(default = "default_service_version")]
    pub version: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            version: default_service_version(),
        }
    }
}

/// Worker process placement and lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct WorkerSection {
    /// Loopback host the worker binds to. Only loopback addresses are accepted.
    #[serde(default = "default_worker_host")]
    pub host: String,
    /// Fixed port the worker listens on. `0` lets the OS choose; the supervisor
    /// learns the bound address from the worker's readiness line.
    #[serde(default = "default_worker_port")]
    pub port: u16,
    /// Path to the worker binary. `None` resolves `inference-worker` next to
    /// the current executable.
    pub binary: Option<PathBuf>,
    /// Maximum time (ms) to wait for the worker's readiness line.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Grace period (ms) for in-flight calls before the worker is killed.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Interval (ms) between liveness log lines of the supervisor.
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    /// Directory for temporary artifacts. `None` uses a fresh directory under
    /// the system temp dir.
    pub scratch_dir: Option<PathBuf>,
    /// Threads available for blocking model calls. `None` uses all cores.
    pub model_threads: Option<usize>,
    /// Artificial latency (ms) added to every simulated model call.
    #[serde(default)]
    pub simulated_latency_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            host: default_worker_host(),
            port: default_worker_port(),
            binary: None,
            startup_timeout_ms: default_startup_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            liveness_interval_ms: default_liveness_interval_ms(),
            scratch_dir: None,
            model_threads: None,
            simulated_latency_ms: 0,
        }
    }
}

impl WorkerSection {
    /// `host:port` the worker binds to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Start-up timeout as a [`Duration`].
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Shutdown grace period as a [`Duration`].
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Liveness interval as a [`Duration`].
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}

/// Cross-process channel tuning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ChannelSection {
    /// Largest frame (bytes) either side will send or accept.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Interval (ms) between keepalive pings on an idle connection.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// Time (ms) a ping may go unanswered before the connection is declared dead.
    #[serde(default = "default_keepalive_timeout_ms")]
    pub keepalive_timeout_ms: u64,
    /// First reconnect backoff delay (ms).
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    /// Upper bound on the reconnect backoff delay (ms).
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// TCP connect timeout (ms).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Deadline (ms) for a whole call, connect included.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

/// Dynamic batching settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BatchingSection {
    /// Route detection requests through the batcher.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum items per batch.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Maximum wait (ms) before an incomplete batch is flushed.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for BatchingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: default_max_batch_size(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl BatchingSection {
    /// Maximum wait as a [`Duration`].
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Circuit breaker settings, applied to every capability.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CircuitBreakerSection {
    /// Failures before the breaker opens.
    #[serde(default = "default_breaker_threshold")]
    pub failure_threshold: usize,
    /// Time (ms) after the last failure before probing.
    #[serde(default = "default_breaker_recovery_ms")]
    pub recovery_timeout_ms: u64,
    /// Probes admitted while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: usize,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_threshold(),
            recovery_timeout_ms: default_breaker_recovery_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl CircuitBreakerSection {
    /// Recovery timeout as a [`Duration`].
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Degradation controller settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DegradationSection {
    /// Consecutive failures before a service is unavailable. Half of this
    /// (rounded down) marks it degraded.
    #[serde(default = "default_degradation_threshold")]
    pub failure_threshold: u32,
    /// Time (ms) between recovery probes of an unavailable service.
    #[serde(default = "default_degradation_recovery_ms")]
    pub recovery_timeout_ms: u64,
}

impl Default for DegradationSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_degradation_threshold(),
            recovery_timeout_ms: default_degradation_recovery_ms(),
        }
    }
}

impl DegradationSection {
    /// Recovery timeout as a [`Duration`].
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Worker-side buffer pool sizing. Buffer sizes double as payload limits.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BufferPoolSection {
    /// Preallocate and reuse buffers. When disabled every acquisition is unpooled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Capacity of each image buffer and the largest accepted image.
    #[serde(default = "default_image_buffer_bytes")]
    pub image_buffer_bytes: usize,
    /// Capacity of each audio buffer and the largest accepted audio clip.
    #[serde(default = "default_audio_buffer_bytes")]
    pub audio_buffer_bytes: usize,
    /// Number of image buffers.
    #[serde(default = "default_image_pool_size")]
    pub image_pool_size: usize,
    /// Number of audio buffers.
    #[serde(default = "default_audio_pool_size")]
    pub audio_pool_size: usize,
}

impl Default for BufferPoolSection {
    fn default() -> Self {
        Self {
            enabled: true,
            image_buffer_bytes: default_image_buffer_bytes(),
            audio_buffer_bytes: default_audio_buffer_bytes(),
            image_pool_size: default_image_pool_size(),
            audio_pool_size: default_audio_pool_size(),
        }
    }
}

/// Result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CacheSection {
    /// Whether results are cached.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum cached entries before eviction.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// TTL (s) for detection results.
    #[serde(default = "default_ttl_detection_s")]
    pub ttl_detection_s: u64,
    /// TTL (s) for OCR results.
    #[serde(default = "default_ttl_ocr_s")]
    pub ttl_ocr_s: u64,
    /// TTL (s) for transcription results.
    #[serde(default = "default_ttl_transcription_s")]
    pub ttl_transcription_s: u64,
    /// TTL (s) for visual question answers.
    #[serde(default = "default_ttl_vqa_s")]
    pub ttl_vqa_s: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_max_entries(),
            ttl_detection_s: default_ttl_detection_s(),
            ttl_ocr_s: default_ttl_ocr_s(),
            ttl_transcription_s: default_ttl_transcription_s(),
            ttl_vqa_s: default_ttl_vqa_s(),
        }
    }
}

/// Per-client rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RateLimitSection {
    /// Whether requests are rate limited.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requests allowed per window per client.
    #[serde(default = "default_rate_limit_requests")]
    pub requests: usize,
    /// Window length in seconds.
    #[serde(default = "default_rate_limit_window_s")]
    pub window_s: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            requests: default_rate_limit_requests(),
            window_s: default_rate_limit_window_s(),
        }
    }
}

/// Scheduler sizing for the request-facing process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RuntimeSection {
    /// Upper bound on blocking-pool threads. `None` uses all cores.
    pub blocking_threads: Option<usize>,
}

impl RuntimeSection {
    /// Resolved blocking-pool size.
    pub fn blocking_threads(&self) -> usize {
        self.blocking_threads
            .unwrap_or_else(crate::available_cores)
            .max(1)
    }
}

/// Export the JSON Schema for `GatewayConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(GatewayConfig);
    serde_json::to_string_pretty(&schema)
}
