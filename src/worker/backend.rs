//! Model backend seam.
//!
//! [`InferenceBackend`] is the synchronous interface the worker drives from
//! its blocking pool. [`SimulatedBackend`] is a deterministic stand-in: the
//! same bytes always produce the same answer, which is what tests and the
//! demo binary need.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use super::BackendError;
use crate::dispatch::{DetectedObject, ModelStatus, OcrLine};

/// Model names reported through `Health`.
pub const MODEL_NAMES: [&str; 4] = ["detection", "ocr", "transcription", "vqa"];

const LABELS: [&str; 10] = [
    "person", "car", "dog", "cat", "bicycle", "chair", "bottle", "laptop", "cup", "book",
];

/// Bytes of 16 kHz 16-bit mono PCM per second of audio.
const AUDIO_BYTES_PER_SECOND: f64 = 32_000.0;

const MIN_TEXT_RUN: usize = 3;

/// Output of a transcription model.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    /// Transcribed text.
    pub text: String,
    /// Detected language code.
    pub language: String,
    /// Clip length in seconds.
    pub duration: f64,
}

/// Synchronous model calls. Implementations may block; the worker always
/// calls them from the blocking pool.
pub trait InferenceBackend: Send + Sync + 'static {
    /// Readiness of every model, as determined at load time.
    fn model_status(&self) -> Vec<ModelStatus>;

    /// Detect objects in each image. Returns one result per input, in order.
    fn detect_batch(&self, images: &[&[u8]]) -> Vec<Result<Vec<DetectedObject>, BackendError>>;

    /// Recognise text lines in an image.
    fn extract_text(&self, image: &[u8], language: &str) -> Result<Vec<OcrLine>, BackendError>;

    /// Transcribe the audio file at `path`.
    fn transcribe(&self, path: &Path) -> Result<Transcript, BackendError>;

    /// Answer `question` about an image.
    fn answer(&self, image: &[u8], question: &str) -> Result<String, BackendError>;
}

/// Deterministic stand-in for the real model set.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBackend {
    latency: Duration,
    unready: HashMap<String, String>,
}

impl SimulatedBackend {
    /// A backend with every model ready and no artificial latency.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every model call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Mark `model` as failed to load; its calls return `NotReady`.
    pub fn with_unready_model(mut self, model: &str, reason: &str) -> Self {
        self.unready.insert(model.to_string(), reason.to_string());
        self
    }

    fn ensure_ready(&self, model: &str) -> Result<(), BackendError> {
        match self.unready.get(model) {
            Some(reason) => Err(BackendError::NotReady {
                model: model.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn simulate_work(&self) {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
    }

    fn detect_one(image: &[u8]) -> Result<Vec<DetectedObject>, BackendError> {
        if image.is_empty() {
            return Err(BackendError::InvalidInput("empty image".to_string()));
        }
        let digest = Sha256::digest(image);
        let count = 1 + usize::from(digest[0] % 3);
        let objects = (0..count)
            .map(|i| {
                let b = &digest[1 + i * 6..7 + i * 6];
                let x1 = f32::from(b[2]) * 2.0;
                let y1 = f32::from(b[3]) * 2.0;
                DetectedObject {
                    label: LABELS[usize::from(b[0]) % LABELS.len()].to_string(),
                    confidence: 0.5 + f32::from(b[1]) / 510.0,
                    bbox: [x1, y1, x1 + 16.0 + f32::from(b[4]), y1 + 16.0 + f32::from(b[5])],
                }
            })
            .collect();
        Ok(objects)
    }
}

/// Printable ASCII runs of at least [`MIN_TEXT_RUN`] characters.
fn text_runs(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|b| !(b.is_ascii_graphic() || *b == b' '))
        .map(|run| String::from_utf8_lossy(run).trim().to_string())
        .filter(|run| run.len() >= MIN_TEXT_RUN)
        .collect()
}

impl InferenceBackend for SimulatedBackend {
    fn model_status(&self) -> Vec<ModelStatus> {
        MODEL_NAMES
            .iter()
            .map(|name| ModelStatus {
                name: (*name).to_string(),
                ready: !self.unready.contains_key(*name),
                error: self.unready.get(*name).cloned(),
            })
            .collect()
    }

    fn detect_batch(&self, images: &[&[u8]]) -> Vec<Result<Vec<DetectedObject>, BackendError>> {
        if let Err(e) = self.ensure_ready("detection") {
            return images.iter().map(|_| Err(e.clone())).collect();
        }
        self.simulate_work();
        images.iter().map(|image| Self::detect_one(image)).collect()
    }

    fn extract_text(&self, image: &[u8], _language: &str) -> Result<Vec<OcrLine>, BackendError> {
        self.ensure_ready("ocr")?;
        if image.is_empty() {
            return Err(BackendError::InvalidInput("empty image".to_string()));
        }
        self.simulate_work();
        let lines = text_runs(image)
            .into_iter()
            .enumerate()
            .map(|(i, text)| {
                let top = 20.0 * i as f32;
                let right = 8.0 * text.len() as f32;
                OcrLine {
                    text,
                    confidence: 0.9,
                    bbox: [0.0, top, right, top, right, top + 16.0, 0.0, top + 16.0],
                }
            })
            .collect();
        Ok(lines)
    }

    fn transcribe(&self, path: &Path) -> Result<Transcript, BackendError> {
        self.ensure_ready("transcription")?;
        let audio = std::fs::read(path)?;
        if audio.is_empty() {
            return Err(BackendError::InvalidInput("empty audio".to_string()));
        }
        self.simulate_work();
        let runs = text_runs(&audio);
        let duration = audio.len() as f64 / AUDIO_BYTES_PER_SECOND;
        let text = if runs.is_empty() {
            format!("[{duration:.1}s of audio]")
        } else {
            runs.join(" ")
        };
        Ok(Transcript {
            text,
            language: "en".to_string(),
            duration,
        })
    }

    fn answer(&self, image: &[u8], question: &str) -> Result<String, BackendError> {
        self.ensure_ready("vqa")?;
        if question.trim().is_empty() {
            return Err(BackendError::InvalidInput("empty question".to_string()));
        }
        let objects = Self::detect_one(image)?;
        self.simulate_work();
        let q = question.to_ascii_lowercase();
        let answer = if q.starts_with("how many") {
            objects.len().to_string()
        } else {
            let label = objects
                .first()
                .map_or("nothing", |o| o.label.as_str());
            format!("It appears to show a {label}.")
        };
        Ok(answer)
    }
}
