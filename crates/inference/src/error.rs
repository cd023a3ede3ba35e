//! Errors from the inference client.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    /// The HTTP request itself failed (connect, DNS, TLS, body decode).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status code.
    #[error("Inference API error ({status}): {body}")]
    Api {
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The service answered `success: false`.
    #[error("Inference failed: {0}")]
    Failure(String),

    #[error("Inference call timed out after {0:?}")]
    Timeout(Duration),

    /// The named breaker is open; no request was sent.
    #[error("Circuit breaker '{0}' is open")]
    BreakerOpen(String),
}

impl InferenceError {
    /// Network errors and 5xx/429 responses may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::Request(e) => !e.is_decode() && !e.is_builder(),
            InferenceError::Api { status, .. } => *status >= 500 || *status == 429,
            InferenceError::Failure(_)
            | InferenceError::Timeout(_)
            | InferenceError::BreakerOpen(_) => false,
        }
    }

    /// Whether the error says something about the health of the service.
    ///
    /// Rejected input (4xx) and model-level `success: false` answers come
    /// from a working service and do not count against the breaker.
    pub fn trips_breaker(&self) -> bool {
        self.is_transient() || matches!(self, InferenceError::Timeout(_))
    }
}
