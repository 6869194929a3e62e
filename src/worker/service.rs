//! Worker-side call handler.
//!
//! Stages each payload into a pooled buffer, runs the synchronous model call
//! on the blocking pool behind a semaphore, and turns the outcome into a
//! reply. Model failures become `success = false` replies; they never tear
//! down the connection.

use async_trait::async_trait;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::backend::InferenceBackend;
use super::scratch::ScratchDir;
use super::BackendError;
use crate::dispatch::{
    CallContext, CallHandler, DetectionResponse, ImageInput, ModelStatus, OcrResponse, RpcRequest,
    RpcResponse, TranscriptionResponse, VqaResponse, WorkerHealth,
};
use crate::resilience::{BufferPool, BufferPools, PooledBuffer};

const DEFAULT_AUDIO_NAME: &str = "audio.wav";
const DEFAULT_LANGUAGE: &str = "en";

/// Serves model calls for one worker process.
pub struct InferenceService<B> {
    backend: Arc<B>,
    pools: BufferPools,
    scratch: ScratchDir,
    permits: Arc<Semaphore>,
    models: Vec<ModelStatus>,
    active: AtomicUsize,
    started: Instant,
}

impl<B: InferenceBackend> InferenceService<B> {
    /// Wrap `backend`. At most `model_threads` model calls run concurrently.
    pub fn new(backend: B, pools: BufferPools, scratch: ScratchDir, model_threads: usize) -> Self {
        let models = backend.model_status();
        for model in &models {
            match &model.error {
                None => info!(model = %model.name, "model ready"),
                Some(reason) => error!(model = %model.name, reason = %reason, "model failed to load"),
            }
        }
        Self {
            backend: Arc::new(backend),
            pools,
            scratch,
            permits: Arc::new(Semaphore::new(model_threads.max(1))),
            models,
            active: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    /// Readiness recorded at start-up.
    pub fn models(&self) -> &[ModelStatus] {
        &self.models
    }

    /// Scratch directory used for audio files.
    pub fn scratch(&self) -> &ScratchDir {
        &self.scratch
    }

    /// Run `f` on the blocking pool once a model slot is free.
    async fn run_model<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&B) -> Result<T, BackendError> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| BackendError::Inference("model pool closed".to_string()))?;
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f(&backend)
        })
        .await
        .map_err(|e| BackendError::Inference(format!("model task failed: {e}")))?
    }

    async fn detect(&self, images: Vec<ImageInput>) -> Vec<DetectionResponse> {
        let count = images.len();
        let staged: Result<Vec<PooledBuffer>, BackendError> = images
            .iter()
            .map(|input| stage(&self.pools.image, &input.image))
            .collect();
        drop(images);

        let outcome = match staged {
            Ok(buffers) => {
                self.run_model(move |backend| {
                    let slices: Vec<&[u8]> = buffers.iter().map(PooledBuffer::as_slice).collect();
                    Ok(backend.detect_batch(&slices))
                })
                .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(results) if results.len() == count => results
                .into_iter()
                .map(|result| match result {
                    Ok(objects) => {
                        debug!(count = objects.len(), "detection completed");
                        DetectionResponse {
                            success: true,
                            message: "Detection successful".to_string(),
                            objects,
                        }
                    }
                    Err(e) => detection_failure(&e.to_string()),
                })
                .collect(),
            Ok(results) => {
                let message = format!("model returned {} results for {count} images", results.len());
                error!(%message, "detection failed");
                vec![detection_failure(&message); count]
            }
            Err(e) => {
                error!(error = %e, "detection failed");
                vec![detection_failure(&e.to_string()); count]
            }
        }
    }

    async fn extract_text(&self, image: Vec<u8>, language: String) -> OcrResponse {
        let language = if language.is_empty() {
            DEFAULT_LANGUAGE.to_string()
        } else {
            language
        };
        let outcome = match stage(&self.pools.image, &image) {
            Ok(buffer) => {
                drop(image);
                self.run_model(move |backend| backend.extract_text(buffer.as_slice(), &language))
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(lines) => {
                debug!(lines = lines.len(), "ocr completed");
                let full_text = lines
                    .iter()
                    .map(|l| l.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                OcrResponse {
                    success: true,
                    message: "OCR successful".to_string(),
                    full_text,
                    lines,
                }
            }
            Err(e) => {
                error!(error = %e, "ocr failed");
                OcrResponse {
                    success: false,
                    message: e.to_string(),
                    full_text: String::new(),
                    lines: Vec::new(),
                }
            }
        }
    }

    async fn transcribe(&self, filename: String, audio: Vec<u8>) -> TranscriptionResponse {
        let filename = if filename.is_empty() {
            DEFAULT_AUDIO_NAME.to_string()
        } else {
            filename
        };
        let scratch = self.scratch.clone();
        let outcome = match stage(&self.pools.audio, &audio) {
            Ok(buffer) => {
                drop(audio);
                self.run_model(move |backend| {
                    let mut file = scratch.audio_file(&filename)?;
                    file.write_all(buffer.as_slice())?;
                    file.flush()?;
                    drop(buffer);
                    backend.transcribe(file.path())
                })
                .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(t) => {
                debug!(duration = t.duration, "transcription completed");
                TranscriptionResponse {
                    success: true,
                    text: t.text,
                    language: t.language,
                    duration: t.duration,
                }
            }
            Err(e) => {
                error!(error = %e, "transcription failed");
                TranscriptionResponse {
                    success: false,
                    text: e.to_string(),
                    language: String::new(),
                    duration: 0.0,
                }
            }
        }
    }

    async fn answer(&self, image: Vec<u8>, question: String) -> VqaResponse {
        let outcome = match stage(&self.pools.image, &image) {
            Ok(buffer) => {
                drop(image);
                self.run_model(move |backend| backend.answer(buffer.as_slice(), &question))
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(answer) => {
                debug!(answer_length = answer.len(), "vqa completed");
                VqaResponse {
                    success: true,
                    message: "Question answered".to_string(),
                    answer,
                }
            }
            Err(e) => {
                error!(error = %e, "vqa failed");
                VqaResponse {
                    success: false,
                    message: e.to_string(),
                    answer: String::new(),
                }
            }
        }
    }

    /// Current readiness and load.
    pub fn health(&self) -> WorkerHealth {
        WorkerHealth {
            models: self.models.clone(),
            in_flight: self.active.load(Ordering::SeqCst),
            uptime_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            pools: self.pools.snapshots(),
        }
    }
}

/// Copy `bytes` into a buffer from `pool`.
fn stage(pool: &BufferPool, bytes: &[u8]) -> Result<PooledBuffer, BackendError> {
    let mut buffer = pool.acquire();
    buffer.write_all(bytes)?;
    Ok(buffer)
}

fn detection_failure(message: &str) -> DetectionResponse {
    DetectionResponse {
        success: false,
        message: message.to_string(),
        objects: Vec::new(),
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl<B: InferenceBackend> CallHandler for InferenceService<B> {
    async fn handle(&self, request: RpcRequest, ctx: CallContext) -> RpcResponse {
        if matches!(request, RpcRequest::Health) {
            return RpcResponse::Health(self.health());
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        match request {
            RpcRequest::DetectObjects { image, filename } => {
                let mut results = self.detect(vec![ImageInput { filename, image }]).await;
                match results.pop() {
                    Some(result) => RpcResponse::Detection(result),
                    None => RpcResponse::Error {
                        message: "detection produced no result".to_string(),
                        shutting_down: false,
                    },
                }
            }
            RpcRequest::DetectObjectsBatch { images } => {
                let members = ctx.batch_trace_ids();
                debug!(batch_size = images.len(), members = ?members, "detection batch received");
                RpcResponse::DetectionBatch(self.detect(images).await)
            }
            RpcRequest::ExtractText { image, language, .. } => {
                RpcResponse::Ocr(self.extract_text(image, language).await)
            }
            RpcRequest::TranscribeAudio { filename, audio } => {
                RpcResponse::Transcription(self.transcribe(filename, audio).await)
            }
            RpcRequest::AnswerVisualQuestion { image, question, .. } => {
                RpcResponse::Vqa(self.answer(image, question).await)
            }
            RpcRequest::Health => {
                warn!("health request reached model dispatch");
                RpcResponse::Health(self.health())
            }
        }
    }
}
