//! Wire types exchanged between the gateway and the worker.
//!
//! Every frame carries a `call_id` so replies can be matched to calls on a
//! single multiplexed connection. Calls carry string metadata; the trace id
//! travels under [`TRACE_ID_KEY`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::resilience::BufferPoolSnapshot;

/// Metadata key carrying the request trace id.
pub const TRACE_ID_KEY: &str = "x-request-id";

/// Metadata key carrying the comma-separated trace ids of a batch call.
pub const BATCH_TRACE_IDS_KEY: &str = "x-batch-request-ids";

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Correlates a reply (or pong) with its call (or ping).
    pub call_id: u64,
    /// Frame body.
    pub kind: FrameKind,
}

/// Frame body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrameKind {
    /// A call from the gateway.
    Call {
        /// String metadata, including the trace id.
        metadata: HashMap<String, String>,
        /// The request itself.
        request: RpcRequest,
    },
    /// The worker's answer to a call.
    Reply(RpcResponse),
    /// Keepalive probe.
    Ping,
    /// Keepalive answer.
    Pong,
}

/// An image with the name it was uploaded under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInput {
    /// Original file name.
    pub filename: String,
    /// Encoded image bytes.
    pub image: Vec<u8>,
}

/// Worker RPC surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcRequest {
    /// Object detection on one image.
    DetectObjects {
        /// Original file name.
        filename: String,
        /// Encoded image bytes.
        image: Vec<u8>,
    },
    /// Object detection on several images in one model call.
    DetectObjectsBatch {
        /// Images in batch order.
        images: Vec<ImageInput>,
    },
    /// Text extraction.
    ExtractText {
        /// Original file name.
        filename: String,
        /// Encoded image bytes.
        image: Vec<u8>,
        /// Language hint.
        language: String,
    },
    /// Speech to text.
    TranscribeAudio {
        /// Original file name.
        filename: String,
        /// Encoded audio bytes.
        audio: Vec<u8>,
    },
    /// Free-form question about an image.
    AnswerVisualQuestion {
        /// Original file name.
        filename: String,
        /// Encoded image bytes.
        image: Vec<u8>,
        /// The question.
        question: String,
    },
    /// Liveness and readiness probe.
    Health,
}

impl RpcRequest {
    /// Method name used in logs and metrics.
    pub fn method(&self) -> &'static str {
        match self {
            Self::DetectObjects { .. } => "DetectObjects",
            Self::DetectObjectsBatch { .. } => "DetectObjectsBatch",
            Self::ExtractText { .. } => "ExtractText",
            Self::TranscribeAudio { .. } => "TranscribeAudio",
            Self::AnswerVisualQuestion { .. } => "AnswerVisualQuestion",
            Self::Health => "Health",
        }
    }
}

/// One detected object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    /// Class label.
    pub label: String,
    /// Score in `[0, 1]`.
    pub confidence: f32,
    /// `[x1, y1, x2, y2]`.
    pub bbox: [f32; 4],
}

/// Result of `DetectObjects`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    /// Whether the model produced a result.
    pub success: bool,
    /// Error description when `success` is false.
    pub message: String,
    /// Detected objects.
    pub objects: Vec<DetectedObject>,
}

/// One line of recognised text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrLine {
    /// Recognised text.
    pub text: String,
    /// Score in `[0, 1]`.
    pub confidence: f32,
    /// Four corner points, `[x1, y1, …, x4, y4]`.
    pub bbox: [f32; 8],
}

/// Result of `ExtractText`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResponse {
    /// Whether the model produced a result.
    pub success: bool,
    /// Error description when `success` is false.
    pub message: String,
    /// All lines joined with newlines.
    pub full_text: String,
    /// Individual lines.
    pub lines: Vec<OcrLine>,
}

/// Result of `TranscribeAudio`. On failure the error is carried in `text`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    /// Whether the model produced a result.
    pub success: bool,
    /// Transcript, or the error description on failure.
    pub text: String,
    /// Detected language.
    pub language: String,
    /// Clip duration in seconds.
    pub duration: f64,
}

/// Result of `AnswerVisualQuestion`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VqaResponse {
    /// Whether the model produced a result.
    pub success: bool,
    /// Error description when `success` is false.
    pub message: String,
    /// The answer.
    pub answer: String,
}

/// Load state of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    /// Model name (`detection`, `ocr`, `transcription`, `vqa`).
    pub name: String,
    /// Whether the model is ready to serve.
    pub ready: bool,
    /// Load error, if any.
    pub error: Option<String>,
}

/// Result of `Health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    /// Per-model readiness.
    pub models: Vec<ModelStatus>,
    /// Calls currently being handled.
    pub in_flight: usize,
    /// Time since the worker started.
    pub uptime_ms: u64,
    /// Buffer pool statistics.
    pub pools: Vec<BufferPoolSnapshot>,
}

/// Worker replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcResponse {
    /// Reply to `DetectObjects`.
    Detection(DetectionResponse),
    /// Reply to `DetectObjectsBatch`, in request order.
    DetectionBatch(Vec<DetectionResponse>),
    /// Reply to `ExtractText`.
    Ocr(OcrResponse),
    /// Reply to `TranscribeAudio`.
    Transcription(TranscriptionResponse),
    /// Reply to `AnswerVisualQuestion`.
    Vqa(VqaResponse),
    /// Reply to `Health`.
    Health(WorkerHealth),
    /// The worker could not handle the call at all.
    Error {
        /// What went wrong.
        message: String,
        /// The worker is draining and refuses new work.
        shutting_down: bool,
    },
}

impl RpcResponse {
    /// Variant name for protocol error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Detection(_) => "Detection",
            Self::DetectionBatch(_) => "DetectionBatch",
            Self::Ocr(_) => "Ocr",
            Self::Transcription(_) => "Transcription",
            Self::Vqa(_) => "Vqa",
            Self::Health(_) => "Health",
            Self::Error { .. } => "Error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names_match_rpc_surface() {
        let req = RpcRequest::ExtractText {
            filename: "a.png".into(),
            image: vec![1],
            language: "en".into(),
        };
        assert_eq!(req.method(), "ExtractText");
        assert_eq!(RpcRequest::Health.method(), "Health");
        assert_eq!(
            RpcRequest::DetectObjectsBatch { images: vec![] }.method(),
            "DetectObjectsBatch"
        );
    }

    #[test]
    fn test_response_kind_names() {
        let resp = RpcResponse::Error {
            message: "x".into(),
            shutting_down: false,
        };
        assert_eq!(resp.kind(), "Error");
        assert_eq!(RpcResponse::DetectionBatch(vec![]).kind(), "DetectionBatch");
    }
}
