use axum::extract::State;
use axum::{routing::get, Json, Router};
use spheroseg_pipeline::QueueStatus;

use crate::state::AppState;

/// GET /api/v1/segmentation/queue -- queue counts and running tasks.
///
/// Never fails: when task rows cannot be read the running list is returned
/// without image names.
async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.orchestrator.status().await)
}

pub fn router() -> Router<AppState> {
    Router::new().route("/queue", get(queue_status))
}
