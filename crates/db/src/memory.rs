//! In-process [`SegmentationStore`] with the same compare-and-set rules as
//! the Postgres store.
//!
//! Used when no `DATABASE_URL` is configured and throughout the test suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::segmentation_task::{CreateSegmentationTask, ImageContext, SegmentationTask};
use crate::models::status::SegmentationStatus;
use crate::store::{SegmentationStore, StoreError};

#[derive(Default)]
struct Tables {
    tasks: HashMap<Uuid, SegmentationTask>,
    images: HashMap<String, ImageContext>,
}

/// Map-backed store.
#[derive(Default)]
pub struct MemorySegmentationStore {
    tables: Mutex<Tables>,
    failing: AtomicBool,
    failing_writes: AtomicBool,
}

impl MemorySegmentationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register image metadata returned by `image_context`.
    pub fn with_image(self, context: ImageContext) -> Self {
        self.seed_image(context);
        self
    }

    pub fn seed_image(&self, context: ImageContext) {
        self.tables()
            .images
            .insert(context.image_id.clone(), context);
    }

    /// Insert a row as-is, bypassing the active-row check.
    pub fn seed_task(&self, task: SegmentationTask) {
        self.tables().tasks.insert(task.id, task);
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make status writes fail while reads keep working.
    pub fn set_failing_writes(&self, failing: bool) {
        self.failing_writes.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of every row, oldest first.
    pub fn all_tasks(&self) -> Vec<SegmentationTask> {
        let mut rows: Vec<_> = self.tables().tasks.values().cloned().collect();
        rows.sort_by_key(|t| t.created_at);
        rows
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".into()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        self.check()?;
        if self.failing_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store writes set to fail".into()));
        }
        Ok(())
    }

    /// Apply `update` to row `id` if its status is one of `from`.
    fn update_if(
        &self,
        id: Uuid,
        from: &[SegmentationStatus],
        update: impl FnOnce(&mut SegmentationTask),
    ) -> Result<bool, StoreError> {
        self.check_write()?;
        let mut tables = self.tables();
        let Some(row) = tables.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if !from.iter().any(|s| row.has_status(*s)) {
            return Ok(false);
        }
        update(row);
        row.updated_at = chrono::Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl SegmentationStore for MemorySegmentationStore {
    async fn create(&self, input: &CreateSegmentationTask) -> Result<SegmentationTask, StoreError> {
        self.check_write()?;
        let mut tables = self.tables();
        let active = tables.tasks.values().any(|t| {
            t.image_id == input.image_id
                && t.status().is_some_and(|s| !s.is_terminal())
        });
        if active {
            return Err(StoreError::Conflict(format!(
                "Image {} already has an active segmentation task",
                input.image_id
            )));
        }

        let now = chrono::Utc::now();
        let row = SegmentationTask {
            id: Uuid::now_v7(),
            image_id: input.image_id.clone(),
            image_path: input.image_path.clone(),
            parameters: input.parameters.clone(),
            priority: input.priority,
            status_id: SegmentationStatus::Pending.id(),
            retries: 0,
            error: None,
            result: None,
            result_path: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        tables.tasks.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<SegmentationTask>, StoreError> {
        self.check()?;
        Ok(self.tables().tasks.get(&id).cloned())
    }

    async fn find_active_by_image(
        &self,
        image_id: &str,
    ) -> Result<Option<SegmentationTask>, StoreError> {
        self.check()?;
        Ok(self
            .tables()
            .tasks
            .values()
            .filter(|t| t.image_id == image_id && t.status().is_some_and(|s| !s.is_terminal()))
            .max_by_key(|t| t.created_at)
            .cloned())
    }

    async fn update_request(
        &self,
        id: Uuid,
        image_path: &str,
        parameters: &serde_json::Value,
        priority: i32,
    ) -> Result<bool, StoreError> {
        self.update_if(id, &[SegmentationStatus::Pending], |row| {
            row.image_path = image_path.to_string();
            row.parameters = parameters.clone();
            row.priority = priority;
        })
    }

    async fn mark_processing(&self, id: Uuid) -> Result<bool, StoreError> {
        self.update_if(id, &[SegmentationStatus::Pending], |row| {
            row.status_id = SegmentationStatus::Processing.id();
            row.started_at = Some(chrono::Utc::now());
            row.error = None;
        })
    }

    async fn record_retry(&self, id: Uuid, error: &str) -> Result<bool, StoreError> {
        self.update_if(id, &[SegmentationStatus::Processing], |row| {
            row.status_id = SegmentationStatus::Pending.id();
            row.retries += 1;
            row.error = Some(error.to_string());
        })
    }

    async fn requeue(&self, id: Uuid) -> Result<bool, StoreError> {
        self.update_if(id, &[SegmentationStatus::Processing], |row| {
            row.status_id = SegmentationStatus::Pending.id();
            row.started_at = None;
        })
    }

    async fn complete(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        result_path: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.update_if(id, &[SegmentationStatus::Processing], |row| {
            row.status_id = SegmentationStatus::Completed.id();
            row.result = Some(result.clone());
            row.result_path = result_path.map(str::to_string);
            row.error = None;
            row.completed_at = Some(chrono::Utc::now());
        })
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<bool, StoreError> {
        self.update_if(id, &SegmentationStatus::ACTIVE, |row| {
            row.status_id = SegmentationStatus::Failed.id();
            row.error = Some(error.to_string());
            row.completed_at = Some(chrono::Utc::now());
        })
    }

    async fn cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        self.update_if(id, &SegmentationStatus::ACTIVE, |row| {
            row.status_id = SegmentationStatus::Cancelled.id();
            row.completed_at = Some(chrono::Utc::now());
        })
    }

    async fn list_by_status(
        &self,
        status: SegmentationStatus,
    ) -> Result<Vec<SegmentationTask>, StoreError> {
        self.check()?;
        let mut rows: Vec<_> = self
            .tables()
            .tasks
            .values()
            .filter(|t| t.has_status(status))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(rows)
    }

    async fn image_context(&self, image_id: &str) -> Result<Option<ImageContext>, StoreError> {
        self.check()?;
        Ok(self.tables().images.get(image_id).cloned())
    }
}
