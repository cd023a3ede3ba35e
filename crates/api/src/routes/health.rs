use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use spheroseg_inference::InferenceStats;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok` when every dependency is healthy, `degraded` otherwise.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// `postgres` or `memory`.
    pub store: &'static str,
    /// Whether the database is reachable. Always true for the memory store.
    pub db_healthy: bool,
    pub inference: InferenceHealth,
    pub queue_started: bool,
    pub connections: usize,
}

#[derive(Serialize)]
pub struct InferenceHealth {
    /// Result of the unguarded health probe.
    pub healthy: bool,
    /// False while the segmentation breaker is open.
    pub available: bool,
    /// Whatever the service reported, or the probe error.
    pub details: serde_json::Value,
    pub breakers: InferenceStats,
}

/// GET /health -- returns service and dependency health.
///
/// The inference probe bypasses the breakers so recovery is visible while
/// they are open.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (store, db_healthy) = match &state.pool {
        Some(pool) => ("postgres", spheroseg_db::health_check(pool).await.is_ok()),
        None => ("memory", true),
    };

    let (healthy, details) = match state.inference.check_health().await {
        Ok(health) => (health.healthy, health.details),
        Err(e) => (false, serde_json::json!({ "error": e.to_string() })),
    };

    let status = if db_healthy && healthy { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        store,
        db_healthy,
        inference: InferenceHealth {
            healthy,
            available: state.inference.is_available(),
            details,
            breakers: state.inference.stats(),
        },
        queue_started: state.orchestrator.queue().is_started(),
        connections: state.hub.connection_count().await,
    })
}

/// Mount health check routes (intended for root-level, NOT under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
