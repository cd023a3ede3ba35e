//! Executor bound to the `segmentation` task kind.
//!
//! One attempt: check the source image, mark the row `processing`, segment,
//! optionally extract features, then persist the outcome and notify the
//! project room. Status writes are compare-and-set, so an attempt that lost
//! its row to a cancel or time-out cannot overwrite it. Store failures are
//! logged and never change the task's outcome.

use async_trait::async_trait;
use spheroseg_core::queue::{TaskContext, TaskError, TaskExecutor};
use spheroseg_db::models::status::SegmentationStatus;
use spheroseg_events::ProgressUpdate;
use uuid::Uuid;

use crate::context::{PipelineContext, SegmentationPayload, Write};
use crate::error::{classify_inference_error, sanitize_error};

pub(crate) struct SegmentationExecutor {
    ctx: PipelineContext,
}

/// What the attempt works on, read from the row when possible.
struct Request {
    image_id: String,
    image_path: String,
    parameters: serde_json::Value,
}

struct Completion {
    result: serde_json::Value,
    result_path: Option<String>,
}

impl SegmentationExecutor {
    pub(crate) fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    async fn resolve_request(&self, task: &TaskContext) -> Result<Request, TaskError> {
        match self.ctx.store.find_by_id(task.id).await {
            Ok(Some(row)) => {
                if row.status().is_some_and(SegmentationStatus::is_terminal) {
                    tracing::debug!(task_id = %task.id, status_id = row.status_id, "Row already settled");
                    return Err(TaskError::Cancelled);
                }
                return Ok(Request {
                    image_id: row.image_id,
                    image_path: row.image_path,
                    parameters: row.parameters,
                });
            }
            Ok(None) => {
                tracing::warn!(task_id = %task.id, "No persisted row for segmentation task");
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Failed to load segmentation row, using queued payload");
            }
        }

        let payload: SegmentationPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| TaskError::Validation(format!("invalid segmentation payload: {e}")))?;
        Ok(Request {
            image_id: payload.image_id,
            image_path: payload.image_path,
            parameters: payload.parameters,
        })
    }

    async fn run(&self, task: &TaskContext, request: &Request) -> Result<Completion, TaskError> {
        ensure_readable(&request.image_path).await?;
        self.mark_processing(task.id).await?;
        self.ctx
            .notify_immediate(ProgressUpdate::new(
                &request.image_id,
                SegmentationStatus::Processing,
            ))
            .await;

        let mut result = tokio::select! {
            biased;
            _ = task.cancel.cancelled() => return Err(TaskError::Cancelled),
            r = self.ctx.service.segment(&request.image_path, &request.parameters) => {
                r.map_err(classify_inference_error)?
            }
        };

        if self.ctx.config.extract_features {
            self.attach_features(task, &mut result).await?;
        }

        let result_path = result
            .get("result_path")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        Ok(Completion {
            result,
            result_path,
        })
    }

    /// Best effort: a failed extraction leaves the polygons-only result.
    async fn attach_features(
        &self,
        task: &TaskContext,
        result: &mut serde_json::Value,
    ) -> Result<(), TaskError> {
        let Some(polygons) = result
            .get("polygons")
            .filter(|p| p.as_array().is_some_and(|a| !a.is_empty()))
            .cloned()
        else {
            return Ok(());
        };

        let features = tokio::select! {
            biased;
            _ = task.cancel.cancelled() => return Err(TaskError::Cancelled),
            r = self.ctx.service.extract_features(&polygons) => r,
        };
        match features {
            Ok(features) => {
                if let Some(obj) = result.as_object_mut() {
                    obj.insert("features".into(), features);
                }
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Feature extraction failed, completing with polygons only");
            }
        }
        Ok(())
    }

    /// Move the row to `processing`. An attempt whose row was settled
    /// elsewhere stops here.
    async fn mark_processing(&self, id: Uuid) -> Result<(), TaskError> {
        let write = self
            .ctx
            .write("mark_processing", id, self.ctx.store.mark_processing(id).await);
        if write != Write::Skipped {
            return Ok(());
        }
        match self.ctx.store.find_by_id(id).await {
            Ok(Some(row)) if !row.has_status(SegmentationStatus::Processing) => {
                Err(TaskError::Cancelled)
            }
            _ => Ok(()),
        }
    }

    async fn record_success(&self, id: Uuid, request: &Request, done: &Completion) {
        let write = self.ctx.write(
            "complete",
            id,
            self.ctx
                .store
                .complete(id, &done.result, done.result_path.as_deref())
                .await,
        );
        if !write.should_notify() {
            return;
        }
        let mut update = ProgressUpdate::new(&request.image_id, SegmentationStatus::Completed);
        if let Some(path) = &done.result_path {
            update = update.with_result_path(path);
        }
        self.ctx.notify(update).await;
        tracing::info!(task_id = %id, image_id = %request.image_id, "Segmentation completed");
    }

    async fn record_failure(
        &self,
        task: &TaskContext,
        image_id: Option<&str>,
        err: &TaskError,
    ) {
        let id = task.id;
        let message = sanitize_error(err);

        let (write, update) = match err {
            // Settled by whoever cancelled or timed the attempt out.
            TaskError::Cancelled => return,
            e if e.is_retryable() && !task.is_final_attempt() => {
                let write = self
                    .ctx
                    .write("record_retry", id, self.ctx.store.record_retry(id, &message).await);
                (write, image_id.map(|i| ProgressUpdate::new(i, SegmentationStatus::Pending)))
            }
            _ => {
                let write = self.ctx.write("fail", id, self.ctx.store.fail(id, &message).await);
                tracing::warn!(task_id = %id, attempt = task.attempt, error = %err, "Segmentation failed");
                (
                    write,
                    image_id.map(|i| {
                        ProgressUpdate::new(i, SegmentationStatus::Failed).with_error(&message)
                    }),
                )
            }
        };

        if let Some(update) = update.filter(|_| write.should_notify()) {
            self.ctx.notify(update).await;
        }
    }
}

#[async_trait]
impl TaskExecutor for SegmentationExecutor {
    async fn execute(&self, task: TaskContext) -> Result<serde_json::Value, TaskError> {
        let request = match self.resolve_request(&task).await {
            Ok(request) => request,
            Err(err) => {
                self.record_failure(&task, None, &err).await;
                return Err(err);
            }
        };

        match self.run(&task, &request).await {
            Ok(done) => {
                self.record_success(task.id, &request, &done).await;
                Ok(done.result)
            }
            Err(err) => {
                self.record_failure(&task, Some(&request.image_id), &err).await;
                Err(err)
            }
        }
    }
}

async fn ensure_readable(path: &str) -> Result<(), TaskError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(TaskError::Validation(format!("{path} is not a file"))),
        Err(e) => Err(TaskError::Validation(format!("cannot read {path}: {e}"))),
    }
}
