//! # Pipeline
//!
//! ## Responsibility
//! The composition root. For each request: admit it past the rate limiter,
//! validate the payload, consult the result cache, ask the degradation
//! controller whether to serve a fallback, then run the dispatch call (through
//! the detection batcher where enabled) inside the capability's circuit
//! breaker and record the outcome.
//!
//! ## Guarantees
//! - Injected: every collaborator is built once by [`PipelineComponents`]
//!   and handed in; there are no globals
//! - Classified: every failure surfaces as exactly one [`PipelineError`] kind
//! - Honest cache: only genuine worker results are cached, never fallbacks
//! - Bounded: every call to the worker is bounded by the channel call timeout
//!
//! ## NOT Responsible For
//! - Retrying (callers decide using [`PipelineError::is_temporarily_unavailable`])
//! - Transport (see [`crate::dispatch`])

pub mod fallback;
pub mod types;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{BufferPoolSection, CircuitBreakerSection, GatewayConfig};
use crate::dispatch::{DetectionResponse, DispatchClient, DispatchError, ImageInput, WorkerHealth};
use crate::edge::{cache_key, cache_key_parts, CacheLayer, CacheStats, CacheTtls, RateLimiter};
use crate::resilience::{
    BatchError, BatchMeta, BatcherSnapshot, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerError, CircuitBreakerSnapshot, DegradationController, DynamicBatcher,
    ServiceHealthSnapshot,
};
use crate::{metrics, TraceId};

pub use types::{
    BatchItemResult, BatchSummary, Detection, DetectionData, OcrData, ReplyStatus, ServiceReply,
    TextBox, TextLine, TranscriptionData, VqaData,
};

/// Most images accepted by one [`RequestPipeline::detect_many`] call; extra
/// files are ignored.
pub const MAX_BATCH_FILES: usize = 10;

/// The four capabilities served by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// Object detection.
    Detection,
    /// Text extraction.
    Ocr,
    /// Speech to text.
    Transcription,
    /// Visual question answering.
    Vqa,
}

impl Service {
    /// Every capability.
    pub const ALL: [Service; 4] = [Self::Detection, Self::Ocr, Self::Transcription, Self::Vqa];

    /// Name used by the degradation controller, breakers, logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::Ocr => "ocr",
            Self::Transcription => "transcription",
            Self::Vqa => "vqa",
        }
    }

    fn cache_op(self) -> &'static str {
        match self {
            Self::Detection => "detect",
            Self::Ocr => "ocr",
            Self::Transcription => "transcribe",
            Self::Vqa => "vqa",
        }
    }
}

/// Why a request produced no reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The request was malformed; nothing reached the core.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The client exceeded its request quota.
    #[error("rate limit exceeded for client {client}")]
    RateLimited {
        /// Client id that was refused.
        client: String,
    },

    /// The worker could not be reached or did not answer in time.
    #[error("{service} unavailable: {reason}")]
    Unavailable {
        /// Capability that failed.
        service: String,
        /// Underlying transport failure.
        reason: String,
    },

    /// The worker answered but the model failed.
    #[error("{service} failed: {message}")]
    Backend {
        /// Capability that failed.
        service: String,
        /// Failure reported by the worker.
        message: String,
    },

    /// The capability's circuit breaker rejected the call without trying it.
    #[error("{service} circuit open")]
    BreakerOpen {
        /// Capability whose breaker is open.
        service: String,
    },

    /// A gateway-side task failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether retrying later could succeed without changing the request.
    pub fn is_temporarily_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::BreakerOpen { .. })
    }

    /// Label used for the `outcome` metric.
    fn outcome(&self) -> &'static str {
        match self {
            Self::Validation(_) => "rejected",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable { .. } => "unavailable",
            Self::Backend { .. } => "backend_error",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// Who is asking, and the id that follows the request across processes.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// Rate-limit key, typically the peer address.
    pub client_id: String,
    /// Propagated as `x-request-id` on every dispatch call.
    pub trace_id: TraceId,
}

impl RequestMeta {
    /// Request from `client_id` with a fresh trace id.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            trace_id: TraceId::generate(),
        }
    }

    /// Request from `client_id` continuing an existing trace.
    pub fn with_trace_id(client_id: impl Into<String>, trace_id: TraceId) -> Self {
        Self {
            client_id: client_id.into(),
            trace_id,
        }
    }
}

/// Batcher that coalesces single-image detection calls into
/// `DetectObjectsBatch`.
pub type DetectionBatcher = DynamicBatcher<ImageInput, DetectionResponse, DispatchError>;

/// Build the detection batcher over `client`.
pub fn detection_batcher(
    client: DispatchClient,
    max_batch_size: usize,
    max_wait: Duration,
) -> DetectionBatcher {
    DynamicBatcher::new(
        "detection",
        max_batch_size,
        max_wait,
        move |images: Vec<ImageInput>, meta: BatchMeta| {
            let client = client.clone();
            async move { client.detect_objects_batch(images, &meta.trace_ids).await }
        },
    )
}

/// One breaker per capability.
#[derive(Debug, Clone)]
pub struct ServiceBreakers {
    /// Guards detection calls.
    pub detection: CircuitBreaker,
    /// Guards OCR calls.
    pub ocr: CircuitBreaker,
    /// Guards transcription calls.
    pub transcription: CircuitBreaker,
    /// Guards VQA calls.
    pub vqa: CircuitBreaker,
}

impl ServiceBreakers {
    /// Four breakers sharing the `[circuit_breaker]` thresholds.
    pub fn from_section(section: &CircuitBreakerSection) -> Self {
        let make = |service: Service| {
            CircuitBreaker::new(CircuitBreakerConfig::from_section(service.as_str(), section))
        };
        Self {
            detection: make(Service::Detection),
            ocr: make(Service::Ocr),
            transcription: make(Service::Transcription),
            vqa: make(Service::Vqa),
        }
    }

    /// Breaker guarding `service`.
    pub fn get(&self, service: Service) -> &CircuitBreaker {
        match service {
            Service::Detection => &self.detection,
            Service::Ocr => &self.ocr,
            Service::Transcription => &self.transcription,
            Service::Vqa => &self.vqa,
        }
    }

    /// Snapshots in capability order.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        Service::ALL.iter().map(|s| self.get(*s).snapshot()).collect()
    }
}

/// Largest payloads accepted per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLimits {
    /// Images (detection, OCR, VQA).
    pub max_image_bytes: usize,
    /// Audio clips.
    pub max_audio_bytes: usize,
}

impl PayloadLimits {
    /// Limits match the worker's buffer sizes.
    pub fn from_section(section: &BufferPoolSection) -> Self {
        Self {
            max_image_bytes: section.image_buffer_bytes,
            max_audio_bytes: section.audio_buffer_bytes,
        }
    }
}

/// Everything the pipeline is built from.
pub struct PipelineComponents {
    /// Per-capability breakers.
    pub breakers: ServiceBreakers,
    /// Health tracker and fallback decision point.
    pub degradation: DegradationController,
    /// Detection batcher; `None` sends one call per image.
    pub detection_batcher: Option<DetectionBatcher>,
    /// Result cache.
    pub cache: CacheLayer,
    /// Per-capability cache TTLs.
    pub cache_ttls: CacheTtls,
    /// Per-client rate limiter.
    pub limiter: RateLimiter,
    /// Payload size limits.
    pub limits: PayloadLimits,
}

impl PipelineComponents {
    /// Build every collaborator from config.
    pub fn from_config(config: &GatewayConfig, client: &DispatchClient) -> Self {
        let detection_batcher = config.batching.enabled.then(|| {
            detection_batcher(
                client.clone(),
                config.batching.max_batch_size,
                config.batching.max_wait(),
            )
        });
        Self {
            breakers: ServiceBreakers::from_section(&config.circuit_breaker),
            degradation: DegradationController::from_section(&config.degradation),
            detection_batcher,
            cache: CacheLayer::from_section(&config.cache),
            cache_ttls: CacheTtls::from_section(&config.cache),
            limiter: RateLimiter::from_section(&config.rate_limit),
            limits: PayloadLimits::from_section(&config.buffer_pool),
        }
    }
}

/// Aggregated view of the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    /// Per-service health, ordered by name.
    pub services: BTreeMap<String, ServiceHealthSnapshot>,
    /// Per-capability breakers.
    pub breakers: Vec<CircuitBreakerSnapshot>,
    /// Batchers in use.
    pub batchers: Vec<BatcherSnapshot>,
    /// Result cache counters.
    pub cache: CacheStats,
    /// Whether the dispatch client holds a live connection.
    pub worker_connected: bool,
    /// Worker readiness, load and buffer pools, when the probe answered.
    pub worker: Option<WorkerHealth>,
}

struct PipelineInner {
    client: DispatchClient,
    breakers: ServiceBreakers,
    degradation: DegradationController,
    detection_batcher: Option<DetectionBatcher>,
    cache: CacheLayer,
    cache_ttls: CacheTtls,
    limiter: RateLimiter,
    limits: PayloadLimits,
}

/// Serves the four capabilities. Cheap to clone.
#[derive(Clone)]
pub struct RequestPipeline {
    inner: Arc<PipelineInner>,
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("worker", &self.inner.client.addr())
            .field("batching", &self.inner.detection_batcher.is_some())
            .field("cache", &self.inner.cache.is_enabled())
            .finish()
    }
}

impl RequestPipeline {
    /// Assemble a pipeline from prebuilt parts.
    pub fn new(client: DispatchClient, components: PipelineComponents) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                client,
                breakers: components.breakers,
                degradation: components.degradation,
                detection_batcher: components.detection_batcher,
                cache: components.cache,
                cache_ttls: components.cache_ttls,
                limiter: components.limiter,
                limits: components.limits,
            }),
        }
    }

    /// Build every part from config.
    pub fn from_config(config: &GatewayConfig, client: DispatchClient) -> Self {
        let components = PipelineComponents::from_config(config, &client);
        Self::new(client, components)
    }

    /// The health tracker.
    pub fn degradation(&self) -> &DegradationController {
        &self.inner.degradation
    }

    /// The per-capability breakers.
    pub fn breakers(&self) -> &ServiceBreakers {
        &self.inner.breakers
    }

    /// The result cache.
    pub fn cache(&self) -> &CacheLayer {
        &self.inner.cache
    }

    /// The dispatch client.
    pub fn client(&self) -> &DispatchClient {
        &self.inner.client
    }

    /// Detect objects in one image.
    ///
    /// # Errors
    ///
    /// Any [`PipelineError`].
    pub async fn detect_objects(
        &self,
        meta: &RequestMeta,
        filename: &str,
        image: Vec<u8>,
        language: &str,
    ) -> Result<ServiceReply<DetectionData>, PipelineError> {
        self.admit(Service::Detection, meta)?;
        self.detect_admitted(meta.trace_id.clone(), filename, image, language)
            .await
    }

    /// Detect objects in up to [`MAX_BATCH_FILES`] images concurrently.
    ///
    /// The whole request counts once against the rate limit. Each file gets a
    /// trace id derived from the request's and its own result or error.
    ///
    /// # Errors
    ///
    /// `RateLimited`, or `Validation` when `files` is empty. Per-file failures
    /// are reported inside the summary.
    pub async fn detect_many(
        &self,
        meta: &RequestMeta,
        files: Vec<(String, Vec<u8>)>,
        language: &str,
    ) -> Result<BatchSummary, PipelineError> {
        self.admit(Service::Detection, meta)?;
        if files.is_empty() {
            metrics::inc_request(Service::Detection.as_str(), "rejected");
            return Err(PipelineError::Validation("no files provided".to_string()));
        }
        if files.len() > MAX_BATCH_FILES {
            warn!(
                trace_id = %meta.trace_id,
                files = files.len(),
                max = MAX_BATCH_FILES,
                "too many files in batch request, extra files ignored"
            );
        }

        let per_file = files
            .into_iter()
            .take(MAX_BATCH_FILES)
            .enumerate()
            .map(|(i, (filename, image))| {
                let trace_id = TraceId::new(format!("{}-{i}", meta.trace_id));
                async move {
                    let outcome = self
                        .detect_admitted(trace_id, &filename, image, language)
                        .await;
                    match outcome {
                        Ok(reply) => BatchItemResult::ok(filename, reply),
                        Err(e) => BatchItemResult::failed(filename, e.to_string()),
                    }
                }
            });
        let summary = BatchSummary::from_results(join_all(per_file).await);
        info!(
            trace_id = %meta.trace_id,
            total = summary.total_files,
            successful = summary.successful,
            failed = summary.failed,
            "batch detection finished"
        );
        Ok(summary)
    }

    async fn detect_admitted(
        &self,
        trace_id: TraceId,
        filename: &str,
        image: Vec<u8>,
        language: &str,
    ) -> Result<ServiceReply<DetectionData>, PipelineError> {
        let service = Service::Detection;
        self.validate(service, &image, self.inner.limits.max_image_bytes)?;
        let (key, image) = self.keyed(service, image, Some(language)).await?;
        let span = info_span!("request", service = service.as_str(), trace_id = %trace_id);

        let attempt = || async move {
            let response = match &self.inner.detection_batcher {
                Some(batcher) => {
                    let input = ImageInput {
                        filename: filename.to_string(),
                        image,
                    };
                    // Flushes run one at a time, so a queued item can wait
                    // behind a stuck batch; bound the caller on its own.
                    let bound = self.inner.client.settings().call_timeout + batcher.max_wait();
                    match tokio::time::timeout(bound, batcher.add(input, trace_id.clone())).await {
                        Ok(result) => result.map_err(|e| classify_batch(service, &e))?,
                        Err(_) => {
                            warn!(
                                service = service.as_str(),
                                bound_ms = bound.as_millis() as u64,
                                "detection batch did not complete in time"
                            );
                            return Err(PipelineError::Unavailable {
                                service: service.as_str().to_string(),
                                reason: format!(
                                    "detection batch did not complete within {}ms",
                                    bound.as_millis()
                                ),
                            });
                        }
                    }
                }
                None => self
                    .inner
                    .client
                    .detect_objects(filename, image, &trace_id)
                    .await
                    .map_err(|e| classify(service, &e))?,
            };
            if !response.success {
                return Err(backend_failure(service, response.message));
            }
            Ok(DetectionData::from_response(response, language))
        };

        self.serve(service, filename, key, || fallback::detection(filename, language), attempt)
            .instrument(span)
            .await
    }

    /// Extract text from an image.
    ///
    /// # Errors
    ///
    /// Any [`PipelineError`].
    pub async fn extract_text(
        &self,
        meta: &RequestMeta,
        filename: &str,
        image: Vec<u8>,
        language: &str,
    ) -> Result<ServiceReply<OcrData>, PipelineError> {
        let service = Service::Ocr;
        self.admit(service, meta)?;
        self.validate(service, &image, self.inner.limits.max_image_bytes)?;
        let (key, image) = self.keyed(service, image, Some(language)).await?;
        let trace_id = &meta.trace_id;
        let span = info_span!("request", service = service.as_str(), trace_id = %trace_id);

        let attempt = || async move {
            let response = self
                .inner
                .client
                .extract_text(filename, image, language, trace_id)
                .await
                .map_err(|e| classify(service, &e))?;
            if !response.success {
                return Err(backend_failure(service, response.message));
            }
            Ok(OcrData::from_response(response, language))
        };

        self.serve(service, filename, key, || fallback::ocr(filename, language), attempt)
            .instrument(span)
            .await
    }

    /// Transcribe an audio clip.
    ///
    /// # Errors
    ///
    /// Any [`PipelineError`].
    pub async fn transcribe_audio(
        &self,
        meta: &RequestMeta,
        filename: &str,
        audio: Vec<u8>,
    ) -> Result<ServiceReply<TranscriptionData>, PipelineError> {
        let service = Service::Transcription;
        self.admit(service, meta)?;
        self.validate(service, &audio, self.inner.limits.max_audio_bytes)?;
        let (key, audio) = self.keyed(service, audio, None).await?;
        let trace_id = &meta.trace_id;
        let span = info_span!("request", service = service.as_str(), trace_id = %trace_id);

        let attempt = || async move {
            let response = self
                .inner
                .client
                .transcribe_audio(filename, audio, trace_id)
                .await
                .map_err(|e| classify(service, &e))?;
            if !response.success {
                return Err(backend_failure(service, response.text));
            }
            Ok(TranscriptionData {
                text: response.text,
                language: response.language,
                duration: response.duration,
            })
        };

        self.serve(service, filename, key, || fallback::transcription(filename), attempt)
            .instrument(span)
            .await
    }

    /// Answer a free-form question about an image.
    ///
    /// # Errors
    ///
    /// Any [`PipelineError`]; `Validation` for a blank question.
    pub async fn answer_visual_question(
        &self,
        meta: &RequestMeta,
        filename: &str,
        image: Vec<u8>,
        question: &str,
    ) -> Result<ServiceReply<VqaData>, PipelineError> {
        let service = Service::Vqa;
        self.admit(service, meta)?;
        let question = question.trim();
        if question.is_empty() {
            metrics::inc_request(service.as_str(), "rejected");
            return Err(PipelineError::Validation("question is empty".to_string()));
        }
        self.validate(service, &image, self.inner.limits.max_image_bytes)?;
        let (key, image) = self.keyed(service, image, Some(question)).await?;
        let trace_id = &meta.trace_id;
        let span = info_span!("request", service = service.as_str(), trace_id = %trace_id);

        let attempt = || async move {
            let response = self
                .inner
                .client
                .answer_visual_question(filename, image, question, trace_id)
                .await
                .map_err(|e| classify(service, &e))?;
            if !response.success {
                return Err(backend_failure(service, response.message));
            }
            Ok(VqaData {
                question: question.to_string(),
                answer: response.answer,
            })
        };

        self.serve(service, filename, key, || fallback::vqa(filename, question), attempt)
            .instrument(span)
            .await
    }

    /// Health, breakers, batchers and cache, without contacting the worker.
    pub fn snapshot(&self) -> GatewayStatus {
        GatewayStatus {
            services: self.inner.degradation.snapshot(),
            breakers: self.inner.breakers.snapshots(),
            batchers: self
                .inner
                .detection_batcher
                .iter()
                .map(DynamicBatcher::snapshot)
                .collect(),
            cache: self.inner.cache.stats(),
            worker_connected: self.inner.client.is_connected(),
            worker: None,
        }
    }

    /// [`snapshot`](Self::snapshot) plus the worker's own health, if it
    /// answers within `probe_timeout`. The probe is not recorded anywhere.
    pub async fn status(&self, probe_timeout: Duration) -> GatewayStatus {
        let trace_id = TraceId::generate();
        let probe = tokio::time::timeout(probe_timeout, self.inner.client.health(&trace_id)).await;
        let mut status = self.snapshot();
        match probe {
            Ok(Ok(health)) => status.worker = Some(health),
            Ok(Err(e)) => debug!(error = %e, "worker health probe failed"),
            Err(_) => debug!(timeout_ms = probe_timeout.as_millis() as u64, "worker health probe timed out"),
        }
        status
    }

    fn admit(&self, service: Service, meta: &RequestMeta) -> Result<(), PipelineError> {
        if self.inner.limiter.check(&meta.client_id) {
            return Ok(());
        }
        let err = PipelineError::RateLimited {
            client: meta.client_id.clone(),
        };
        metrics::inc_request(service.as_str(), err.outcome());
        Err(err)
    }

    fn validate(&self, service: Service, payload: &[u8], max: usize) -> Result<(), PipelineError> {
        let problem = if payload.is_empty() {
            "payload is empty".to_string()
        } else if payload.len() > max {
            format!("payload of {} bytes exceeds the {max} byte limit", payload.len())
        } else {
            return Ok(());
        };
        debug!(service = service.as_str(), %problem, "request rejected");
        metrics::inc_request(service.as_str(), "rejected");
        Err(PipelineError::Validation(problem))
    }

    /// Compute the cache key on the blocking pool, handing the payload back.
    async fn keyed(
        &self,
        service: Service,
        payload: Vec<u8>,
        qualifier: Option<&str>,
    ) -> Result<(Option<String>, Vec<u8>), PipelineError> {
        if !self.inner.cache.is_enabled() {
            return Ok((None, payload));
        }
        let op = service.cache_op();
        let qualifier = qualifier.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            let key = match &qualifier {
                Some(q) => cache_key_parts(op, &[payload.as_slice(), b"\0".as_slice(), q.as_bytes()]),
                None => cache_key(op, &payload),
            };
            (Some(key), payload)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("cache key task failed: {e}")))
    }

    fn ttl(&self, service: Service) -> Duration {
        let ttls = &self.inner.cache_ttls;
        match service {
            Service::Detection => ttls.detection,
            Service::Ocr => ttls.ocr,
            Service::Transcription => ttls.transcription,
            Service::Vqa => ttls.vqa,
        }
    }

    /// Cache, then degradation, then the guarded attempt; records the outcome.
    async fn serve<T, FB, F, Fut>(
        &self,
        service: Service,
        filename: &str,
        key: Option<String>,
        fallback: FB,
        attempt: F,
    ) -> Result<ServiceReply<T>, PipelineError>
    where
        T: Serialize + DeserializeOwned,
        FB: FnOnce() -> ServiceReply<T>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let name = service.as_str();

        if let Some(key) = &key {
            if let Some(data) = self.inner.cache.get::<T>(key) {
                metrics::inc_request(name, "cached");
                let mut reply = ServiceReply::success(filename, data);
                reply.cached = true;
                return Ok(reply);
            }
        }

        if self.inner.degradation.should_use_fallback(name) {
            info!(service = name, "service unavailable, serving fallback");
            metrics::inc_fallback(name);
            metrics::inc_request(name, "fallback");
            return Ok(fallback());
        }

        match self.inner.breakers.get(service).execute(attempt).await {
            Ok(data) => {
                self.inner.degradation.record_success(name);
                if let Some(key) = &key {
                    self.inner.cache.set(key, &data, self.ttl(service));
                }
                metrics::inc_request(name, "success");
                Ok(ServiceReply::success(filename, data))
            }
            Err(CircuitBreakerError::Open { .. }) => {
                debug!(service = name, "rejected by open circuit");
                let err = PipelineError::BreakerOpen {
                    service: name.to_string(),
                };
                metrics::inc_request(name, err.outcome());
                Err(err)
            }
            Err(CircuitBreakerError::Failed(err)) => {
                self.inner.degradation.record_failure(name);
                match &err {
                    PipelineError::Backend { message, .. } => {
                        warn!(service = name, %message, "backend reported failure");
                    }
                    other => warn!(service = name, error = %other, "backend unavailable"),
                }
                metrics::inc_request(name, err.outcome());
                Err(err)
            }
        }
    }
}

fn classify(service: Service, err: &DispatchError) -> PipelineError {
    if err.is_unavailable() {
        PipelineError::Unavailable {
            service: service.as_str().to_string(),
            reason: err.to_string(),
        }
    } else {
        backend_failure(service, err.to_string())
    }
}

fn classify_batch(service: Service, err: &BatchError<DispatchError>) -> PipelineError {
    match err {
        BatchError::Process(cause) => classify(service, cause),
        BatchError::Abandoned => PipelineError::Unavailable {
            service: service.as_str().to_string(),
            reason: err.to_string(),
        },
        BatchError::ResultCountMismatch { .. } | BatchError::Panicked(_) => {
            backend_failure(service, err.to_string())
        }
    }
}

fn backend_failure(service: Service, message: String) -> PipelineError {
    PipelineError::Backend {
        service: service.as_str().to_string(),
        message,
    }
}
