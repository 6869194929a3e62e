//! Reply shapes handed back to pipeline callers.

use serde::{Deserialize, Serialize};

use crate::dispatch::{DetectedObject, DetectionResponse, OcrLine, OcrResponse};

/// Whether a reply came from the model or from the fallback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// Produced by the worker.
    Success,
    /// Canned response served while the service is unavailable.
    Degraded,
}

/// One reply from the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceReply<T> {
    /// Name the payload was submitted under.
    pub filename: String,
    /// Success or degraded.
    pub status: ReplyStatus,
    /// Capability-specific result.
    pub data: T,
    /// Set when `data` is a canned fallback.
    pub is_fallback: bool,
    /// Set when `data` was served from the result cache.
    #[serde(default)]
    pub cached: bool,
}

impl<T> ServiceReply<T> {
    /// A reply produced by the worker.
    pub fn success(filename: impl Into<String>, data: T) -> Self {
        Self {
            filename: filename.into(),
            status: ReplyStatus::Success,
            data,
            is_fallback: false,
            cached: false,
        }
    }

    /// A canned reply.
    pub fn degraded(filename: impl Into<String>, data: T) -> Self {
        Self {
            filename: filename.into(),
            status: ReplyStatus::Degraded,
            data,
            is_fallback: true,
            cached: false,
        }
    }
}

/// A detected object with its confidence rounded to four decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class label.
    pub label: String,
    /// Score in `[0, 1]`.
    pub confidence: f32,
    /// `[x1, y1, x2, y2]`.
    pub bbox: [f32; 4],
}

impl From<DetectedObject> for Detection {
    fn from(obj: DetectedObject) -> Self {
        Self {
            label: obj.label,
            confidence: round4(obj.confidence),
            bbox: obj.bbox,
        }
    }
}

/// Object detection result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionData {
    /// Language the caller asked labels in.
    pub language: String,
    /// Number of objects.
    pub count: usize,
    /// The objects.
    pub detections: Vec<Detection>,
}

impl DetectionData {
    /// Shape a worker reply.
    pub fn from_response(response: DetectionResponse, language: &str) -> Self {
        let detections: Vec<Detection> = response.objects.into_iter().map(Detection::from).collect();
        Self {
            language: language.to_string(),
            count: detections.len(),
            detections,
        }
    }
}

/// Corner points of one text line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBox {
    /// `[x, y]`.
    pub top_left: [f32; 2],
    /// `[x, y]`.
    pub top_right: [f32; 2],
    /// `[x, y]`.
    pub bottom_right: [f32; 2],
    /// `[x, y]`.
    pub bottom_left: [f32; 2],
}

impl From<[f32; 8]> for TextBox {
    fn from(p: [f32; 8]) -> Self {
        Self {
            top_left: [p[0], p[1]],
            top_right: [p[2], p[3]],
            bottom_right: [p[4], p[5]],
            bottom_left: [p[6], p[7]],
        }
    }
}

/// One recognised line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    /// Recognised text.
    pub text: String,
    /// Score rounded to four decimals.
    pub confidence: f32,
    /// Where the line sits in the image.
    pub bbox: TextBox,
}

impl From<OcrLine> for TextLine {
    fn from(line: OcrLine) -> Self {
        Self {
            text: line.text,
            confidence: round4(line.confidence),
            bbox: TextBox::from(line.bbox),
        }
    }
}

/// Text extraction result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrData {
    /// All lines joined with newlines.
    pub full_text: String,
    /// Whitespace-separated words in `full_text`.
    pub word_count: usize,
    /// Number of lines.
    pub line_count: usize,
    /// Language hint the text was read with.
    pub language: String,
    /// Individual lines.
    pub lines: Vec<TextLine>,
}

impl OcrData {
    /// Shape a worker reply.
    pub fn from_response(response: OcrResponse, language: &str) -> Self {
        let lines: Vec<TextLine> = response.lines.into_iter().map(TextLine::from).collect();
        Self {
            word_count: response.full_text.split_whitespace().count(),
            line_count: lines.len(),
            full_text: response.full_text,
            language: language.to_string(),
            lines,
        }
    }
}

/// Speech-to-text result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionData {
    /// Transcript.
    pub text: String,
    /// Detected language.
    pub language: String,
    /// Clip length in seconds.
    pub duration: f64,
}

/// Visual question answering result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VqaData {
    /// The question as asked.
    pub question: String,
    /// The answer.
    pub answer: String,
}

/// Outcome of one file in a multi-image detection request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    /// Name the image was submitted under.
    pub filename: String,
    /// `"success"` or `"error"`.
    pub status: String,
    /// Present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ServiceReply<DetectionData>>,
    /// Present on error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItemResult {
    pub(crate) fn ok(filename: String, reply: ServiceReply<DetectionData>) -> Self {
        Self {
            filename,
            status: "success".to_string(),
            data: Some(reply),
            error: None,
        }
    }

    pub(crate) fn failed(filename: String, error: impl Into<String>) -> Self {
        Self {
            filename,
            status: "error".to_string(),
            data: None,
            error: Some(error.into()),
        }
    }

    /// Whether this file succeeded.
    pub fn is_success(&self) -> bool {
        self.data.is_some()
    }
}

/// Summary of a multi-image detection request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Files considered.
    pub total_files: usize,
    /// Files with a result.
    pub successful: usize,
    /// Files with an error.
    pub failed: usize,
    /// Per-file outcomes, in submission order.
    pub results: Vec<BatchItemResult>,
}

impl BatchSummary {
    pub(crate) fn from_results(results: Vec<BatchItemResult>) -> Self {
        let successful = results.iter().filter(|r| r.is_success()).count();
        Self {
            total_files: results.len(),
            successful,
            failed: results.len() - successful,
            results,
        }
    }
}

fn round4(value: f32) -> f32 {
    (value * 10_000.0).round() / 10_000.0
}
