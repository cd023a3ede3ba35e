//! Repository for the `segmentation_tasks` table.
//!
//! Every status write is conditional on the current status and reports
//! whether a row changed, so racing writers (a late executor result versus
//! a cancel) cannot overwrite each other.

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::segmentation_task::{CreateSegmentationTask, ImageContext, SegmentationTask};
use crate::models::status::SegmentationStatus;

/// Column list for `segmentation_tasks` queries.
const COLUMNS: &str = "\
    id, image_id, image_path, parameters, priority, status_id, retries, \
    error, result, result_path, \
    created_at, updated_at, started_at, completed_at";

/// Name of the partial unique index guarding one active row per image.
pub const ACTIVE_IMAGE_INDEX: &str = "uq_segmentation_tasks_active_image";

/// Provides persistence for segmentation requests.
pub struct SegmentationTaskRepo;

impl SegmentationTaskRepo {
    /// Insert a new pending row.
    pub async fn create(
        pool: &PgPool,
        input: &CreateSegmentationTask,
    ) -> Result<SegmentationTask, sqlx::Error> {
        let query = format!(
            "INSERT INTO segmentation_tasks (image_id, image_path, parameters, priority, status_id) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, SegmentationTask>(&query)
            .bind(&input.image_id)
            .bind(&input.image_path)
            .bind(&input.parameters)
            .bind(input.priority)
            .bind(SegmentationStatus::Pending.id())
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(
        pool: &PgPool,
        id: Uuid,
    ) -> Result<Option<SegmentationTask>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM segmentation_tasks WHERE id = $1");
        sqlx::query_as::<_, SegmentationTask>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// The pending or processing row for an image, if any.
    pub async fn find_active_by_image(
        pool: &PgPool,
        image_id: &str,
    ) -> Result<Option<SegmentationTask>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM segmentation_tasks \
             WHERE image_id = $1 AND status_id IN ($2, $3) \
             ORDER BY created_at DESC \
             LIMIT 1"
        );
        sqlx::query_as::<_, SegmentationTask>(&query)
            .bind(image_id)
            .bind(SegmentationStatus::Pending.id())
            .bind(SegmentationStatus::Processing.id())
            .fetch_optional(pool)
            .await
    }

    /// Replace the request fields of a pending row.
    pub async fn update_request(
        pool: &PgPool,
        id: Uuid,
        image_path: &str,
        parameters: &serde_json::Value,
        priority: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE segmentation_tasks \
             SET image_path = $2, parameters = $3, priority = $4, updated_at = NOW() \
             WHERE id = $1 AND status_id = $5",
        )
        .bind(id)
        .bind(image_path)
        .bind(parameters)
        .bind(priority)
        .bind(SegmentationStatus::Pending.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Pending -> processing.
    pub async fn mark_processing(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        Self::transition(
            pool,
            id,
            SegmentationStatus::Pending,
            SegmentationStatus::Processing,
            "started_at = NOW(), error = NULL",
        )
        .await
    }

    /// Processing -> pending after a transient failure, counting the retry.
    pub async fn record_retry(pool: &PgPool, id: Uuid, error: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE segmentation_tasks \
             SET status_id = $2, retries = retries + 1, error = $3, updated_at = NOW() \
             WHERE id = $1 AND status_id = $4",
        )
        .bind(id)
        .bind(SegmentationStatus::Pending.id())
        .bind(error)
        .bind(SegmentationStatus::Processing.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Processing -> pending without counting a retry.
    pub async fn requeue(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        Self::transition(
            pool,
            id,
            SegmentationStatus::Processing,
            SegmentationStatus::Pending,
            "started_at = NULL",
        )
        .await
    }

    /// Processing -> completed with the inference result.
    pub async fn complete(
        pool: &PgPool,
        id: Uuid,
        result: &serde_json::Value,
        result_path: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let outcome = sqlx::query(
            "UPDATE segmentation_tasks \
             SET status_id = $2, result = $3, result_path = $4, error = NULL, \
                 completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id = $5",
        )
        .bind(id)
        .bind(SegmentationStatus::Completed.id())
        .bind(result)
        .bind(result_path)
        .bind(SegmentationStatus::Processing.id())
        .execute(pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    /// Pending or processing -> failed.
    pub async fn fail(pool: &PgPool, id: Uuid, error: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE segmentation_tasks \
             SET status_id = $2, error = $3, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($4, $5)",
        )
        .bind(id)
        .bind(SegmentationStatus::Failed.id())
        .bind(error)
        .bind(SegmentationStatus::Pending.id())
        .bind(SegmentationStatus::Processing.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Pending or processing -> cancelled.
    pub async fn cancel(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE segmentation_tasks \
             SET status_id = $2, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status_id IN ($3, $4)",
        )
        .bind(id)
        .bind(SegmentationStatus::Cancelled.id())
        .bind(SegmentationStatus::Pending.id())
        .bind(SegmentationStatus::Processing.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Rows in `status`, highest priority first, oldest first among equals.
    pub async fn list_by_status(
        pool: &PgPool,
        status: SegmentationStatus,
    ) -> Result<Vec<SegmentationTask>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM segmentation_tasks \
             WHERE status_id = $1 \
             ORDER BY priority DESC, created_at ASC"
        );
        sqlx::query_as::<_, SegmentationTask>(&query)
            .bind(status.id())
            .fetch_all(pool)
            .await
    }

    /// Image and project names for an image id.
    pub async fn image_context(
        pool: &PgPool,
        image_id: &str,
    ) -> Result<Option<ImageContext>, sqlx::Error> {
        sqlx::query_as::<_, ImageContext>(
            "SELECT i.id AS image_id, i.name AS image_name, \
                    p.id AS project_id, p.name AS project_name \
             FROM images i \
             LEFT JOIN projects p ON p.id = i.project_id \
             WHERE i.id = $1",
        )
        .bind(image_id)
        .fetch_optional(pool)
        .await
    }

    /// Conditional status change with extra `SET` assignments.
    async fn transition(
        pool: &PgPool,
        id: Uuid,
        from: SegmentationStatus,
        to: SegmentationStatus,
        extra_set: &str,
    ) -> Result<bool, sqlx::Error> {
        let query = format!(
            "UPDATE segmentation_tasks \
             SET status_id = $2, {extra_set}, updated_at = NOW() \
             WHERE id = $1 AND status_id = $3"
        );
        let result = sqlx::query(&query)
            .bind(id)
            .bind(to.id())
            .bind(from.id())
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
