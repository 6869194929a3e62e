//! Canned replies served while a service is unavailable.
//!
//! Fallbacks carry empty data, `status = degraded` and `is_fallback = true`,
//! and are never cached.

use super::types::{DetectionData, OcrData, ServiceReply, TranscriptionData, VqaData};

/// Answer given when visual question answering is unavailable.
pub const VQA_FALLBACK_ANSWER: &str = "I'm sorry, I cannot process your question at this time.";

/// No objects.
pub fn detection(filename: &str, language: &str) -> ServiceReply<DetectionData> {
    ServiceReply::degraded(
        filename,
        DetectionData {
            language: language.to_string(),
            count: 0,
            detections: Vec::new(),
        },
    )
}

/// No text.
pub fn ocr(filename: &str, language: &str) -> ServiceReply<OcrData> {
    ServiceReply::degraded(
        filename,
        OcrData {
            full_text: String::new(),
            word_count: 0,
            line_count: 0,
            language: language.to_string(),
            lines: Vec::new(),
        },
    )
}

/// Empty transcript in an unknown language.
pub fn transcription(filename: &str) -> ServiceReply<TranscriptionData> {
    ServiceReply::degraded(
        filename,
        TranscriptionData {
            text: String::new(),
            language: "unknown".to_string(),
            duration: 0.0,
        },
    )
}

/// An apology.
pub fn vqa(filename: &str, question: &str) -> ServiceReply<VqaData> {
    ServiceReply::degraded(
        filename,
        VqaData {
            question: question.to_string(),
            answer: VQA_FALLBACK_ANSWER.to_string(),
        },
    )
}
