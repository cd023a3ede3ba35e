//! Binds the task queue to persisted segmentation rows.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use spheroseg_core::error::CoreError;
use spheroseg_core::queue::{TaskError, TaskKind, TaskOptions, TaskQueue, TaskState};
use spheroseg_core::types::Timestamp;
use spheroseg_db::models::segmentation_task::{CreateSegmentationTask, SegmentationTask};
use spheroseg_db::models::status::SegmentationStatus;
use spheroseg_db::store::{SegmentationStore, StoreError};
use spheroseg_events::{ProgressBroadcaster, ProgressUpdate, ServiceStatus};
use spheroseg_inference::BreakerState;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::context::{PipelineContext, SegmentationPayload};
use crate::error::{sanitize_error, PipelineError};
use crate::executor::SegmentationExecutor;
use crate::service::SegmentationService;

/// Task kind handled by the segmentation executor.
pub const SEGMENTATION_KIND: &str = "segmentation";

// ---------------------------------------------------------------------------
// Requests and views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRequest {
    pub image_id: String,
    pub image_path: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
}

impl TriggerRequest {
    fn validate(&self) -> Result<(), PipelineError> {
        if self.image_id.trim().is_empty() {
            return Err(PipelineError::Validation("image_id must not be empty".into()));
        }
        if self.image_path.trim().is_empty() {
            return Err(PipelineError::Validation("image_path must not be empty".into()));
        }
        Ok(())
    }
}

/// A running task with whatever metadata could be looked up.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningTask {
    pub task_id: Uuid,
    pub image_id: Option<String>,
    pub image_name: Option<String>,
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub attempt: u32,
    pub started_at: Option<Timestamp>,
}

/// Queue counters plus dependency health.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_length: usize,
    pub running_count: usize,
    pub max_concurrent: usize,
    pub delayed_count: usize,
    pub pending_ids: Vec<Uuid>,
    pub running_ids: Vec<Uuid>,
    /// False while the inference breaker is open.
    pub service_available: bool,
    pub running: Vec<RunningTask>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SegmentationOrchestrator {
    pub(crate) queue: TaskQueue,
    pub(crate) ctx: PipelineContext,
}

impl SegmentationOrchestrator {
    pub fn new(
        queue: TaskQueue,
        store: Arc<dyn SegmentationStore>,
        service: Arc<dyn SegmentationService>,
        broadcaster: ProgressBroadcaster,
        config: PipelineConfig,
    ) -> Self {
        Self {
            queue,
            ctx: PipelineContext {
                store,
                service,
                broadcaster,
                config: Arc::new(config),
            },
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn kind() -> TaskKind {
        TaskKind::new(SEGMENTATION_KIND)
    }

    /// Run preflight checks and register the executor if they pass.
    ///
    /// Never fails; `false` leaves the queue without a segmentation
    /// executor so the caller can decide whether to run degraded.
    pub async fn setup(&self) -> bool {
        if let Some(path) = &self.ctx.config.model_path {
            if let Err(e) = tokio::fs::metadata(path).await {
                tracing::error!(path = %path.display(), error = %e, "Model artifact not found");
                return false;
            }
        }

        match self.ctx.service.check_health().await {
            Ok(health) if health.healthy => {
                tracing::info!("Inference service healthy");
            }
            Ok(health) => {
                tracing::warn!(details = %health.details, "Inference service reports unhealthy");
                if self.ctx.config.require_healthy {
                    return false;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Inference health probe failed");
                if self.ctx.config.require_healthy {
                    return false;
                }
            }
        }

        let kind = Self::kind();
        if self.queue.has_executor(&kind) {
            return true;
        }
        let executor = Arc::new(SegmentationExecutor::new(self.ctx.clone()));
        match self.queue.register_executor(kind, executor) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Failed to register segmentation executor");
                false
            }
        }
    }

    /// Request segmentation of an image. Returns the persisted task id.
    ///
    /// A pending request for the same image is updated in place; a request
    /// already being processed is left alone. Either way its id is returned.
    pub async fn trigger(&self, request: TriggerRequest) -> Result<Uuid, PipelineError> {
        request.validate()?;
        let store = &self.ctx.store;

        if let Some(row) = store.find_active_by_image(&request.image_id).await? {
            return self.retrigger(row, &request).await;
        }

        let input = CreateSegmentationTask {
            image_id: request.image_id.clone(),
            image_path: request.image_path.clone(),
            parameters: request.parameters.clone(),
            priority: request.priority,
        };
        let row = match store.create(&input).await {
            Ok(row) => row,
            Err(StoreError::Conflict(_)) => {
                // A concurrent trigger for the same image won the insert.
                let existing = store.find_active_by_image(&request.image_id).await?;
                return match existing {
                    Some(row) => self.retrigger(row, &request).await,
                    None => Err(StoreError::Conflict(format!(
                        "Active task for image {} changed during trigger",
                        request.image_id
                    ))
                    .into()),
                };
            }
            Err(e) => return Err(e.into()),
        };

        // Announce before enqueueing; dispatch may start the task at once.
        self.ctx
            .notify(ProgressUpdate::new(&row.image_id, SegmentationStatus::Pending))
            .await;
        if let Err(e) = self.enqueue(&row) {
            let message = sanitize_error(&TaskError::Internal(e.to_string()));
            self.ctx
                .write("fail", row.id, store.fail(row.id, &message).await);
            return Err(e);
        }
        tracing::info!(task_id = %row.id, image_id = %row.image_id, priority = row.priority, "Segmentation triggered");
        Ok(row.id)
    }

    async fn retrigger(
        &self,
        row: SegmentationTask,
        request: &TriggerRequest,
    ) -> Result<Uuid, PipelineError> {
        if row.has_status(SegmentationStatus::Processing) {
            tracing::debug!(task_id = %row.id, image_id = %row.image_id, "Already processing");
            return Ok(row.id);
        }

        let updated = self
            .ctx
            .store
            .update_request(row.id, &request.image_path, &request.parameters, request.priority)
            .await?;
        if !updated {
            // Picked up by the executor in the meantime.
            return Ok(row.id);
        }

        let queued = self.queue.get_task(row.id);
        let resort = queued.as_ref().is_some_and(|task| {
            task.state == TaskState::Pending
                && task.priority != request.priority
                && self.queue.snapshot().pending_ids.contains(&row.id)
        });
        if queued.is_none() {
            // Lost from memory, e.g. by a restart.
            self.enqueue_request(row.id, request)?;
        } else if resort && self.queue.cancel_task(row.id) {
            self.enqueue_request(row.id, request)?;
        }

        tracing::info!(task_id = %row.id, image_id = %row.image_id, priority = request.priority, "Pending segmentation updated");
        Ok(row.id)
    }

    /// Cancel the active request for an image.
    ///
    /// The persisted row is cancelled whether or not the queue still knows
    /// the task. Returns `false` if the image had no active request. If the
    /// row cannot be written the queued task is left untouched.
    pub async fn cancel(&self, image_id: &str) -> Result<bool, PipelineError> {
        let Some(row) = self.ctx.store.find_active_by_image(image_id).await? else {
            return Ok(false);
        };

        let cancelled = self.ctx.store.cancel(row.id).await?;
        let in_memory = self.queue.cancel_task(row.id);
        tracing::info!(task_id = %row.id, image_id, in_memory, cancelled, "Segmentation cancelled");

        if cancelled {
            self.ctx
                .notify(
                    ProgressUpdate::new(image_id, SegmentationStatus::Cancelled)
                        .with_error(sanitize_error(&TaskError::Cancelled)),
                )
                .await;
        }
        Ok(cancelled)
    }

    /// Queue snapshot enriched with image and project names.
    ///
    /// Lookup failures degrade to bare ids; this never fails.
    pub async fn status(&self) -> QueueStatus {
        let snapshot = self.queue.snapshot();
        let mut running = Vec::new();
        let mut lookups_ok = true;

        for task in self.queue.running_tasks() {
            let image_id = task
                .payload
                .get("image_id")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);

            let mut entry = RunningTask {
                task_id: task.id,
                image_id: image_id.clone(),
                image_name: None,
                project_id: None,
                project_name: None,
                attempt: task.attempts,
                started_at: task.started_at,
            };

            if let Some(image_id) = image_id.as_deref().filter(|_| lookups_ok) {
                match self.ctx.store.image_context(image_id).await {
                    Ok(Some(context)) => {
                        entry.image_name = context.image_name;
                        entry.project_id = context.project_id;
                        entry.project_name = context.project_name;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Queue status enrichment failed");
                        lookups_ok = false;
                    }
                }
            }
            running.push(entry);
        }

        QueueStatus {
            queue_length: snapshot.queue_length,
            running_count: snapshot.running_count,
            max_concurrent: snapshot.max_concurrent,
            delayed_count: snapshot.delayed_count,
            pending_ids: snapshot.pending_ids,
            running_ids: snapshot.running_ids,
            service_available: self.ctx.service.is_available(),
            running,
        }
    }

    // ---- background tasks ----

    /// Relay inference breaker transitions to every connected client.
    pub fn forward_breaker_transitions(&self) -> JoinHandle<()> {
        let mut rx = self.ctx.service.subscribe_transitions();
        let broadcaster = self.ctx.broadcaster.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(transition) => {
                        tracing::info!(
                            breaker = %transition.name,
                            from = %transition.from,
                            to = %transition.to,
                            "Inference breaker transition",
                        );
                        broadcaster
                            .publish_service_status(ServiceStatus {
                                service: transition.name,
                                available: transition.to != BreakerState::Open,
                                state: transition.to.as_str().to_string(),
                                timestamp: transition.at,
                            })
                            .await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Breaker transition forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Persist outcomes the queue decides without the executor: time-outs
    /// and missing executors.
    ///
    /// Reads the queue's verdict channel, which never drops a task, so a
    /// slow store cannot leave a row stuck in `processing`.
    pub fn watch_queue_events(&self) -> JoinHandle<()> {
        let mut verdicts = self.queue.verdicts();
        let this = self.clone();

        tokio::spawn(async move {
            while let Some(task) = verdicts.recv().await {
                if task.kind.as_str() != SEGMENTATION_KIND {
                    continue;
                }
                let err = match task.state {
                    TaskState::TimedOut => TaskError::Timeout(task.timeout),
                    TaskState::Failed => TaskError::NoExecutor(task.kind.clone()),
                    other => {
                        tracing::debug!(task_id = %task.id, state = ?other, "Ignoring verdict");
                        continue;
                    }
                };
                this.fail_row(task.id, &task.payload, &err).await;
            }
        })
    }

    async fn fail_row(&self, id: Uuid, payload: &serde_json::Value, err: &TaskError) {
        let message = sanitize_error(err);
        let write = self
            .ctx
            .write("fail", id, self.ctx.store.fail(id, &message).await);
        if !write.should_notify() {
            return;
        }
        let Some(image_id) = payload.get("image_id").and_then(serde_json::Value::as_str) else {
            return;
        };
        self.ctx
            .notify(ProgressUpdate::new(image_id, SegmentationStatus::Failed).with_error(message))
            .await;
    }

    // ---- enqueueing ----

    pub(crate) fn enqueue(&self, row: &SegmentationTask) -> Result<(), PipelineError> {
        let payload = SegmentationPayload {
            image_id: row.image_id.clone(),
            image_path: row.image_path.clone(),
            parameters: row.parameters.clone(),
        };
        self.add_to_queue(row.id, row.priority, payload)
    }

    fn enqueue_request(&self, id: Uuid, request: &TriggerRequest) -> Result<(), PipelineError> {
        let payload = SegmentationPayload {
            image_id: request.image_id.clone(),
            image_path: request.image_path.clone(),
            parameters: request.parameters.clone(),
        };
        self.add_to_queue(id, request.priority, payload)
    }

    fn add_to_queue(
        &self,
        id: Uuid,
        priority: i32,
        payload: SegmentationPayload,
    ) -> Result<(), PipelineError> {
        let payload = serde_json::to_value(&payload)
            .map_err(|e| PipelineError::Validation(format!("unserialisable payload: {e}")))?;
        let options = TaskOptions::default().with_id(id).with_priority(priority);
        match self.queue.add_task(Self::kind(), payload, options) {
            Ok(_) => Ok(()),
            Err(CoreError::Conflict(_)) => {
                tracing::debug!(task_id = %id, "Task already queued");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
