//! Breaker-guarded access to the inference service.

use tokio::sync::broadcast;

use serde::Serialize;

use crate::api::{HealthStatus, InferenceApi};
use crate::breaker::{BreakerError, BreakerStats, BreakerTransition, CircuitBreaker};
use crate::config::{BreakerConfig, InferenceConfig};
use crate::error::InferenceError;

/// Breaker names as they appear in stats and transition events.
pub const SEGMENT_BREAKER: &str = "ml-segmentation";
pub const FEATURES_BREAKER: &str = "ml-feature-extraction";

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Stats of both breakers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceStats {
    pub segment: BreakerStats,
    pub features: BreakerStats,
}

/// One breaker per expensive endpoint; the health probe bypasses both so
/// recovery stays observable while they are open.
pub struct InferenceService {
    api: InferenceApi,
    config: InferenceConfig,
    segment_breaker: CircuitBreaker,
    features_breaker: CircuitBreaker,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl InferenceService {
    /// Build the service. The breakers' per-call timeouts come from
    /// `config`, overriding any set on `breaker`.
    pub fn new(config: InferenceConfig, breaker: BreakerConfig) -> Self {
        Self::with_api(InferenceApi::new(config.base_url.clone()), config, breaker)
    }

    pub fn with_api(api: InferenceApi, config: InferenceConfig, breaker: BreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        let segment_breaker = CircuitBreaker::with_events(
            SEGMENT_BREAKER,
            breaker.clone().with_call_timeout(config.segment_timeout),
            transitions.clone(),
        );
        let features_breaker = CircuitBreaker::with_events(
            FEATURES_BREAKER,
            breaker.with_call_timeout(config.features_timeout),
            transitions.clone(),
        );
        Self {
            api,
            config,
            segment_breaker,
            features_breaker,
            transitions,
        }
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Segment an image through the segmentation breaker.
    pub async fn segment(
        &self,
        image_path: &str,
        parameters: &serde_json::Value,
    ) -> Result<serde_json::Value, InferenceError> {
        self.segment_breaker
            .call_classified(
                || self.api.segment(image_path, parameters),
                InferenceError::trips_breaker,
            )
            .await
            .map_err(|e| unwrap_breaker_error(&self.segment_breaker, e))
    }

    /// Extract polygon features through the feature breaker.
    pub async fn extract_features(
        &self,
        polygons: &serde_json::Value,
    ) -> Result<serde_json::Value, InferenceError> {
        self.features_breaker
            .call_classified(
                || self.api.extract_features(polygons),
                InferenceError::trips_breaker,
            )
            .await
            .map_err(|e| unwrap_breaker_error(&self.features_breaker, e))
    }

    /// Probe the service directly, bypassing both breakers.
    pub async fn check_health(&self) -> Result<HealthStatus, InferenceError> {
        self.api.health(self.config.health_timeout).await
    }

    /// False while the segmentation breaker is open.
    pub fn is_available(&self) -> bool {
        !self.segment_breaker.is_open()
    }

    pub fn stats(&self) -> InferenceStats {
        InferenceStats {
            segment: self.segment_breaker.stats(),
            features: self.features_breaker.stats(),
        }
    }

    /// Transitions of either breaker.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }
}

fn unwrap_breaker_error(
    breaker: &CircuitBreaker,
    err: BreakerError<InferenceError>,
) -> InferenceError {
    match err {
        BreakerError::Open => InferenceError::BreakerOpen(breaker.name().to_string()),
        BreakerError::Timeout(after) => InferenceError::Timeout(after),
        BreakerError::Inner(e) => e,
    }
}
