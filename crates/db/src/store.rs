//! The persisted-task-store contract.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::segmentation_task::{CreateSegmentationTask, ImageContext, SegmentationTask};
use crate::models::status::SegmentationStatus;
use crate::repositories::segmentation_task_repo::ACTIVE_IMAGE_INDEX;
use crate::repositories::SegmentationTaskRepo;
use crate::DbPool;

/// Errors surfaced by a [`SegmentationStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An active row already exists for the image.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Durable record of segmentation requests.
///
/// Status writes are compare-and-set and return whether the row changed:
///
/// | Method | Applies when the row is |
/// |---|---|
/// | `update_request`, `mark_processing` | pending |
/// | `record_retry`, `requeue`, `complete` | processing |
/// | `fail`, `cancel` | pending or processing |
#[async_trait]
pub trait SegmentationStore: Send + Sync {
    /// Insert a pending row. Fails with [`StoreError::Conflict`] if the
    /// image already has an active row.
    async fn create(&self, input: &CreateSegmentationTask) -> Result<SegmentationTask, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SegmentationTask>, StoreError>;

    /// The pending or processing row for `image_id`.
    async fn find_active_by_image(
        &self,
        image_id: &str,
    ) -> Result<Option<SegmentationTask>, StoreError>;

    async fn update_request(
        &self,
        id: Uuid,
        image_path: &str,
        parameters: &serde_json::Value,
        priority: i32,
    ) -> Result<bool, StoreError>;

    async fn mark_processing(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Back to pending after a transient failure; increments `retries`.
    async fn record_retry(&self, id: Uuid, error: &str) -> Result<bool, StoreError>;

    /// Back to pending without counting a retry.
    async fn requeue(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn complete(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        result_path: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn fail(&self, id: Uuid, error: &str) -> Result<bool, StoreError>;

    async fn cancel(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Rows in `status`, highest priority first.
    async fn list_by_status(
        &self,
        status: SegmentationStatus,
    ) -> Result<Vec<SegmentationTask>, StoreError>;

    async fn image_context(&self, image_id: &str) -> Result<Option<ImageContext>, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// [`SegmentationStore`] backed by the `segmentation_tasks` table.
#[derive(Clone)]
pub struct PgSegmentationStore {
    pool: DbPool,
}

impl PgSegmentationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn is_active_image_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.constraint() == Some(ACTIVE_IMAGE_INDEX),
        _ => false,
    }
}

#[async_trait]
impl SegmentationStore for PgSegmentationStore {
    async fn create(&self, input: &CreateSegmentationTask) -> Result<SegmentationTask, StoreError> {
        SegmentationTaskRepo::create(&self.pool, input)
            .await
            .map_err(|e| {
                if is_active_image_violation(&e) {
                    StoreError::Conflict(format!(
                        "Image {} already has an active segmentation task",
                        input.image_id
                    ))
                } else {
                    StoreError::Database(e)
                }
            })
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SegmentationTask>, StoreError> {
        Ok(SegmentationTaskRepo::find_by_id(&self.pool, id).await?)
    }

    async fn find_active_by_image(
        &self,
        image_id: &str,
    ) -> Result<Option<SegmentationTask>, StoreError> {
        Ok(SegmentationTaskRepo::find_active_by_image(&self.pool, image_id).await?)
    }

    async fn update_request(
        &self,
        id: Uuid,
        image_path: &str,
        parameters: &serde_json::Value,
        priority: i32,
    ) -> Result<bool, StoreError> {
        Ok(
            SegmentationTaskRepo::update_request(&self.pool, id, image_path, parameters, priority)
                .await?,
        )
    }

    async fn mark_processing(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(SegmentationTaskRepo::mark_processing(&self.pool, id).await?)
    }

    async fn record_retry(&self, id: Uuid, error: &str) -> Result<bool, StoreError> {
        Ok(SegmentationTaskRepo::record_retry(&self.pool, id, error).await?)
    }

    async fn requeue(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(SegmentationTaskRepo::requeue(&self.pool, id).await?)
    }

    async fn complete(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        result_path: Option<&str>,
    ) -> Result<bool, StoreError> {
        Ok(SegmentationTaskRepo::complete(&self.pool, id, result, result_path).await?)
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<bool, StoreError> {
        Ok(SegmentationTaskRepo::fail(&self.pool, id, error).await?)
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(SegmentationTaskRepo::cancel(&self.pool, id).await?)
    }

    async fn list_by_status(
        &self,
        status: SegmentationStatus,
    ) -> Result<Vec<SegmentationTask>, StoreError> {
        Ok(SegmentationTaskRepo::list_by_status(&self.pool, status).await?)
    }

    async fn image_context(&self, image_id: &str) -> Result<Option<ImageContext>, StoreError> {
        Ok(SegmentationTaskRepo::image_context(&self.pool, image_id).await?)
    }
}
