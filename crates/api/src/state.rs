use std::sync::Arc;

use spheroseg_db::DbPool;
use spheroseg_events::RoomHub;
use spheroseg_inference::InferenceService;
use spheroseg_pipeline::SegmentationOrchestrator;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// `None` when task rows are kept in memory.
    pub pool: Option<DbPool>,
    pub orchestrator: SegmentationOrchestrator,
    /// Queried directly for breaker stats and the unguarded health probe.
    pub inference: Arc<InferenceService>,
    /// WebSocket connections and their project rooms.
    pub hub: Arc<RoomHub>,
}
