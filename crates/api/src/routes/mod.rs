pub mod health;
pub mod segmentation;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Root-level routes (not under `/api/v1`).
///
/// ```text
/// /health                     service and dependency health (GET)
/// /ws?project_id=...          WebSocket, joins the project room
/// ```
pub fn root_routes() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .route("/ws", get(ws::ws_handler))
}

/// Build the `/api/v1` route tree.
///
/// ```text
/// /segmentation/queue         queue status (GET)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/segmentation", segmentation::router())
}
