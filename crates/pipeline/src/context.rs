//! Dependencies shared by the orchestrator and its executor.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use spheroseg_db::store::{SegmentationStore, StoreError};
use spheroseg_events::{ProgressBroadcaster, ProgressUpdate};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::service::SegmentationService;

/// Queue payload of a `segmentation` task.
///
/// The persisted row is authoritative; the payload is the fallback when the
/// row cannot be read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationPayload {
    pub image_id: String,
    pub image_path: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Result of a compare-and-set status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Write {
    Applied,
    /// The row was not in a state the write applies to.
    Skipped,
    /// The store failed; the outcome is unknown.
    Failed,
}

impl Write {
    /// Subscribers hear about an outcome unless the row has provably moved on.
    pub(crate) fn should_notify(self) -> bool {
        self != Write::Skipped
    }
}

#[derive(Clone)]
pub(crate) struct PipelineContext {
    pub store: Arc<dyn SegmentationStore>,
    pub service: Arc<dyn SegmentationService>,
    pub broadcaster: ProgressBroadcaster,
    pub config: Arc<PipelineConfig>,
}

impl PipelineContext {
    /// Log a failed status write instead of propagating it.
    pub(crate) fn write(&self, op: &'static str, id: Uuid, result: Result<bool, StoreError>) -> Write {
        match result {
            Ok(true) => Write::Applied,
            Ok(false) => {
                tracing::debug!(task_id = %id, op, "Status write skipped, row already moved on");
                Write::Skipped
            }
            Err(e) => {
                tracing::error!(task_id = %id, op, error = %e, "Failed to persist segmentation status");
                Write::Failed
            }
        }
    }

    /// Project room of `image_id`, if it can be resolved.
    pub(crate) async fn room_for(&self, image_id: &str) -> Option<String> {
        match self.store.image_context(image_id).await {
            Ok(context) => context.and_then(|c| c.project_id),
            Err(e) => {
                tracing::warn!(image_id, error = %e, "Failed to resolve project room");
                None
            }
        }
    }

    /// Publish to the image's project room, throttling `processing` ticks.
    pub(crate) async fn notify(&self, update: ProgressUpdate) {
        if let Some(room) = self.room_for(&update.image_id).await {
            self.broadcaster.publish(&room, update).await;
        }
    }

    /// Publish to the image's project room without throttling.
    pub(crate) async fn notify_immediate(&self, update: ProgressUpdate) {
        if let Some(room) = self.room_for(&update.image_id).await {
            self.broadcaster.publish_immediate(&room, update).await;
        }
    }
}
