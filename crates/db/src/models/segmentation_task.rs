//! Segmentation task entity and DTOs.

use serde::{Deserialize, Serialize};
use spheroseg_core::types::Timestamp;
use sqlx::FromRow;
use uuid::Uuid;

use super::status::{SegmentationStatus, StatusId};

/// A row from the `segmentation_tasks` table.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct SegmentationTask {
    pub id: Uuid,
    pub image_id: String,
    pub image_path: String,
    pub parameters: serde_json::Value,
    pub priority: i32,
    pub status_id: StatusId,
    /// Retries consumed so far (first attempt excluded).
    pub retries: i32,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub result_path: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl SegmentationTask {
    /// Decoded status, `None` if the row holds an unknown id.
    pub fn status(&self) -> Option<SegmentationStatus> {
        SegmentationStatus::from_id(self.status_id)
    }

    pub fn has_status(&self, status: SegmentationStatus) -> bool {
        self.status_id == status.id()
    }
}

/// DTO for inserting a new pending row.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSegmentationTask {
    pub image_id: String,
    pub image_path: String,
    pub parameters: serde_json::Value,
    pub priority: i32,
}

/// Human-readable metadata about an image and its owning project.
///
/// The project id doubles as the broadcast room for progress updates.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct ImageContext {
    pub image_id: String,
    pub image_name: Option<String>,
    pub project_id: Option<String>,
    pub project_name: Option<String>,
}
