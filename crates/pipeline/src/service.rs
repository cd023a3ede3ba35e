//! The inference seam the orchestrator depends on.

use async_trait::async_trait;
use spheroseg_inference::{BreakerTransition, HealthStatus, InferenceError, InferenceService};
use tokio::sync::broadcast;

/// Segmentation and feature extraction as seen by the orchestrator.
///
/// Implemented by [`InferenceService`]; tests substitute scripted fakes.
#[async_trait]
pub trait SegmentationService: Send + Sync {
    async fn segment(
        &self,
        image_path: &str,
        parameters: &serde_json::Value,
    ) -> Result<serde_json::Value, InferenceError>;

    async fn extract_features(
        &self,
        polygons: &serde_json::Value,
    ) -> Result<serde_json::Value, InferenceError>;

    /// Direct probe, never short-circuited by a breaker.
    async fn check_health(&self) -> Result<HealthStatus, InferenceError>;

    /// False while segmentation calls are being rejected up front.
    fn is_available(&self) -> bool;

    /// Availability transitions of the underlying dependency.
    fn subscribe_transitions(&self) -> broadcast::Receiver<BreakerTransition>;
}

#[async_trait]
impl SegmentationService for InferenceService {
    async fn segment(
        &self,
        image_path: &str,
        parameters: &serde_json::Value,
    ) -> Result<serde_json::Value, InferenceError> {
        InferenceService::segment(self, image_path, parameters).await
    }

    async fn extract_features(
        &self,
        polygons: &serde_json::Value,
    ) -> Result<serde_json::Value, InferenceError> {
        InferenceService::extract_features(self, polygons).await
    }

    async fn check_health(&self) -> Result<HealthStatus, InferenceError> {
        InferenceService::check_health(self).await
    }

    fn is_available(&self) -> bool {
        InferenceService::is_available(self)
    }

    fn subscribe_transitions(&self) -> broadcast::Receiver<BreakerTransition> {
        self.subscribe()
    }
}
