//! Orchestrator errors and the mapping of inference failures onto task
//! outcomes.

use spheroseg_core::error::CoreError;
use spheroseg_core::queue::TaskError;
use spheroseg_db::store::StoreError;
use spheroseg_inference::InferenceError;

/// Longest inference-provided detail kept in a user-visible message.
const MAX_DETAIL_CHARS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] CoreError),
}

/// Decide how the queue treats an inference failure.
///
/// | Inference error | Task error |
/// |---|---|
/// | network error, 5xx, 429 | `Transient` (retried) |
/// | call timeout | `Timeout` |
/// | breaker open | `Unavailable` |
/// | `success: false`, other 4xx | `Permanent` |
pub fn classify_inference_error(err: InferenceError) -> TaskError {
    match err {
        InferenceError::Timeout(after) => TaskError::Timeout(after),
        InferenceError::BreakerOpen(name) => {
            TaskError::Unavailable(format!("circuit '{name}' is open"))
        }
        InferenceError::Failure(msg) => TaskError::Permanent(msg),
        e if e.is_transient() => TaskError::Transient(e.to_string()),
        e => TaskError::Permanent(e.to_string()),
    }
}

/// Message safe to persist and show to users.
///
/// Fixed text per kind; only inference-provided detail is passed through,
/// with paths scrubbed and length capped.
pub fn sanitize_error(err: &TaskError) -> String {
    match err {
        TaskError::Validation(_) => "Source image is missing or the request is invalid".into(),
        TaskError::NoExecutor(_) => "Segmentation is not available on this server".into(),
        TaskError::Transient(_) => "Segmentation service is temporarily unavailable".into(),
        TaskError::Permanent(detail) => format!("Segmentation failed: {}", scrub(detail)),
        TaskError::Timeout(after) => format!("Segmentation timed out after {}s", after.as_secs()),
        TaskError::Unavailable(_) => "Segmentation service is unavailable".into(),
        TaskError::Cancelled => "Cancelled".into(),
        TaskError::Internal(_) => "An internal error occurred".into(),
    }
}

fn scrub(detail: &str) -> String {
    let words: Vec<&str> = detail
        .split_whitespace()
        .map(|word| {
            if word.contains('/') || word.contains('\\') {
                "[path]"
            } else {
                word
            }
        })
        .collect();
    let joined = words.join(" ");
    if joined.chars().count() <= MAX_DETAIL_CHARS {
        return joined;
    }
    let mut truncated: String = joined.chars().take(MAX_DETAIL_CHARS).collect();
    truncated.push_str("...");
    truncated
}
