//! Segmentation orchestration.
//!
//! [`SegmentationOrchestrator`] keeps the in-memory task queue and the
//! persisted `segmentation_tasks` rows in step: it dedupes triggers per
//! image, registers the executor that calls the inference service, and
//! reports progress to project rooms through the broadcaster.

mod context;
mod executor;

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod reconcile;
pub mod service;

pub use config::{PipelineConfig, ReconcilePolicy};
pub use context::SegmentationPayload;
pub use error::{classify_inference_error, sanitize_error, PipelineError};
pub use orchestrator::{
    QueueStatus, RunningTask, SegmentationOrchestrator, TriggerRequest, SEGMENTATION_KIND,
};
pub use reconcile::{ReconcileReport, INTERRUPTED_MESSAGE};
pub use service::SegmentationService;
