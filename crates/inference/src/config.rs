//! Inference client and breaker settings.
//!
//! Environment parsing lives in the binary; these are plain values with
//! production defaults.

use std::time::Duration;

/// Where the inference service lives and how long each call may take.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Base URL, e.g. `http://localhost:5002`.
    pub base_url: String,
    /// Per-call limit for `POST /segment`.
    pub segment_timeout: Duration,
    /// Per-call limit for `POST /extract_features`.
    pub features_timeout: Duration,
    /// Request timeout for `GET /health`.
    pub health_timeout: Duration,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5002".to_string(),
            segment_timeout: Duration::from_secs(300),
            features_timeout: Duration::from_secs(60),
            health_timeout: Duration::from_secs(5),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures inside the rolling window that open the breaker.
    pub failure_threshold: u32,
    /// Failure percentage that opens the breaker once
    /// `volume_threshold` calls are in the window.
    pub error_percentage: u8,
    pub volume_threshold: u32,
    pub rolling_window: Duration,
    /// How long the breaker stays open before allowing a trial call.
    pub reset_timeout: Duration,
    /// Per-call limit enforced by the breaker. `None` disables it.
    pub call_timeout: Option<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            error_percentage: 50,
            volume_threshold: 10,
            rolling_window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
            call_timeout: None,
        }
    }
}

impl BreakerConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}
