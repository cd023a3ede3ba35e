//! Startup sweep reconciling persisted rows with the empty in-memory queue.

use serde::Serialize;
use spheroseg_db::models::status::SegmentationStatus;
use spheroseg_events::ProgressUpdate;

use crate::config::ReconcilePolicy;
use crate::error::PipelineError;
use crate::orchestrator::SegmentationOrchestrator;

/// Message stored on rows failed by [`ReconcilePolicy::Fail`].
pub const INTERRUPTED_MESSAGE: &str = "Interrupted by restart";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// `processing` rows put back to `pending` and enqueued.
    pub requeued: usize,
    /// `processing` rows failed.
    pub failed: usize,
    /// `pending` rows enqueued again.
    pub restored: usize,
}

impl SegmentationOrchestrator {
    /// Re-enqueue `pending` rows and resolve `processing` rows orphaned by a
    /// previous process, per the configured [`ReconcilePolicy`].
    pub async fn reconcile(&self) -> Result<ReconcileReport, PipelineError> {
        let store = &self.ctx.store;
        let pending = store.list_by_status(SegmentationStatus::Pending).await?;
        let orphaned = store.list_by_status(SegmentationStatus::Processing).await?;
        let mut report = ReconcileReport::default();

        for row in &pending {
            if self.queue.get_task(row.id).is_none() {
                self.enqueue(row)?;
                report.restored += 1;
            }
        }

        for row in &orphaned {
            match self.ctx.config.reconcile_policy {
                ReconcilePolicy::Requeue => {
                    if store.requeue(row.id).await? {
                        self.enqueue(row)?;
                        report.requeued += 1;
                    }
                }
                ReconcilePolicy::Fail => {
                    if store.fail(row.id, INTERRUPTED_MESSAGE).await? {
                        report.failed += 1;
                        self.ctx
                            .notify(
                                ProgressUpdate::new(&row.image_id, SegmentationStatus::Failed)
                                    .with_error(INTERRUPTED_MESSAGE),
                            )
                            .await;
                    }
                }
            }
        }

        tracing::info!(
            requeued = report.requeued,
            failed = report.failed,
            restored = report.restored,
            "Reconciled persisted segmentation tasks",
        );
        Ok(report)
    }
}
