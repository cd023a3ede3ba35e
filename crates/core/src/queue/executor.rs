//! The executor seam: one async handler per [`TaskKind`].

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::TaskError;
use super::task::{TaskId, TaskKind};

/// Everything an executor gets to see about the attempt it is running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Signalled when the queue stops waiting on this attempt
    /// (cancellation or time-out). Cooperative: the executor decides
    /// whether and when to observe it.
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// Whether a retryable failure on this attempt will still be final.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Performs the work for one task kind.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: TaskContext) -> Result<serde_json::Value, TaskError>;
}
