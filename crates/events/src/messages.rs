//! Wire events and payloads.
//!
//! Every event is sent as a JSON text frame `{"event": <name>, "data": <payload>}`.

use serde::Serialize;
use spheroseg_core::types::Timestamp;
use spheroseg_db::models::status::SegmentationStatus;

/// Status change of one image's segmentation, camelCase payload.
pub const EVENT_SEGMENTATION_UPDATE: &str = "segmentation:update";
/// Same change in the older, smaller status vocabulary.
pub const EVENT_SEGMENTATION_UPDATE_LEGACY: &str = "segmentation_update";
/// Inference service availability, sent to every connection.
pub const EVENT_SERVICE_STATUS: &str = "segmentation:service-status";

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub image_id: String,
    pub status: SegmentationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: Timestamp,
}

impl ProgressUpdate {
    pub fn new(image_id: impl Into<String>, status: SegmentationStatus) -> Self {
        Self {
            image_id: image_id.into(),
            status,
            result_path: None,
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_result_path(mut self, path: impl Into<String>) -> Self {
        self.result_path = Some(path.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Payload of [`EVENT_SEGMENTATION_UPDATE`].
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Payload of [`EVENT_SEGMENTATION_UPDATE_LEGACY`].
    pub fn to_legacy_payload(&self) -> serde_json::Value {
        let mut payload = self.to_payload();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("status".into(), legacy_status(self.status).into());
        }
        payload
    }
}

/// Map the persisted status onto the legacy vocabulary
/// (`queued`, `processing`, `completed`, `failed`).
pub fn legacy_status(status: SegmentationStatus) -> &'static str {
    match status {
        SegmentationStatus::Pending => "queued",
        SegmentationStatus::Processing => "processing",
        SegmentationStatus::Completed => "completed",
        SegmentationStatus::Failed | SegmentationStatus::Cancelled => "failed",
    }
}

// ---------------------------------------------------------------------------
// Service status
// ---------------------------------------------------------------------------

/// Availability of the inference dependency.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub service: String,
    pub available: bool,
    /// Breaker state name, e.g. `open`.
    pub state: String,
    pub timestamp: Timestamp,
}

// ---------------------------------------------------------------------------
// OutboundMessage
// ---------------------------------------------------------------------------

/// A message queued for one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Event {
        event: &'static str,
        data: serde_json::Value,
    },
    Ping,
    Close,
}

impl OutboundMessage {
    pub fn event(event: &'static str, data: serde_json::Value) -> Self {
        OutboundMessage::Event { event, data }
    }

    /// JSON text frame for `Event`; `None` for control frames.
    pub fn to_text(&self) -> Option<String> {
        match self {
            OutboundMessage::Event { event, data } => {
                Some(serde_json::json!({ "event": event, "data": data }).to_string())
            }
            OutboundMessage::Ping | OutboundMessage::Close => None,
        }
    }
}
