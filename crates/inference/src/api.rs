//! REST client for the inference service.
//!
//! No timeouts or retries are applied here except on the health probe;
//! callers wrap the expensive endpoints in a circuit breaker.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::InferenceError;

/// HTTP client for one inference service instance.
#[derive(Clone)]
pub struct InferenceApi {
    client: reqwest::Client,
    base_url: String,
}

/// Body of `POST /segment`.
#[derive(Debug, Serialize)]
pub struct SegmentRequest<'a> {
    pub image_path: &'a str,
    pub parameters: &'a serde_json::Value,
}

/// Response envelope of `POST /segment`.
#[derive(Debug, Deserialize)]
pub struct SegmentResponse {
    pub success: bool,
    #[serde(default)]
    pub results: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Response envelope of `POST /extract_features`.
#[derive(Debug, Deserialize)]
pub struct FeaturesResponse {
    pub success: bool,
    #[serde(default)]
    pub features: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Outcome of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    /// Whatever the service reported, verbatim.
    pub details: serde_json::Value,
}

impl InferenceApi {
    /// * `base_url` - e.g. `http://localhost:5002`. A trailing slash is
    ///   ignored.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Run segmentation on an image the service can read from `image_path`.
    ///
    /// Returns the `results` object (polygons and metadata).
    pub async fn segment(
        &self,
        image_path: &str,
        parameters: &serde_json::Value,
    ) -> Result<serde_json::Value, InferenceError> {
        let response = self
            .client
            .post(format!("{}/segment", self.base_url))
            .json(&SegmentRequest {
                image_path,
                parameters,
            })
            .send()
            .await?;

        let body: SegmentResponse = Self::parse_response(response).await?;
        match (body.success, body.results) {
            (true, Some(results)) => Ok(results),
            (true, None) => Err(InferenceError::Failure(
                "response contained no results".to_string(),
            )),
            (false, _) => Err(InferenceError::Failure(
                body.error.unwrap_or_else(|| "unknown error".to_string()),
            )),
        }
    }

    /// Compute per-polygon features.
    pub async fn extract_features(
        &self,
        polygons: &serde_json::Value,
    ) -> Result<serde_json::Value, InferenceError> {
        let response = self
            .client
            .post(format!("{}/extract_features", self.base_url))
            .json(&serde_json::json!({ "polygons": polygons }))
            .send()
            .await?;

        let body: FeaturesResponse = Self::parse_response(response).await?;
        match (body.success, body.features) {
            (true, Some(features)) => Ok(features),
            (true, None) => Err(InferenceError::Failure(
                "response contained no features".to_string(),
            )),
            (false, _) => Err(InferenceError::Failure(
                body.error.unwrap_or_else(|| "unknown error".to_string()),
            )),
        }
    }

    /// Probe `GET /health` with its own request timeout.
    ///
    /// A 2xx answer is healthy unless its body carries a `status` other
    /// than `ok`/`healthy`.
    pub async fn health(&self, timeout: Duration) -> Result<HealthStatus, InferenceError> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout(timeout)
                } else {
                    InferenceError::Request(e)
                }
            })?;

        let details: serde_json::Value = Self::parse_response(response).await?;
        let healthy = match details.get("status").and_then(|s| s.as_str()) {
            Some(status) => matches!(status, "ok" | "healthy"),
            None => true,
        };
        Ok(HealthStatus { healthy, details })
    }

    // ---- private helpers ----

    /// Return the response unchanged on 2xx, or an
    /// [`InferenceError::Api`] with status and body text.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, InferenceError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(InferenceError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, InferenceError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}
