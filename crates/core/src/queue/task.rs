//! Task model and lifecycle state machine.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Identifier of a queued task.
///
/// Callers may supply their own (e.g. the id of a persisted row) so the
/// in-memory task and its durable twin share one identity.
pub type TaskId = uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskKind
// ---------------------------------------------------------------------------

/// Discriminator used to route a task to its executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKind(String);

impl TaskKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskKind {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// Lifecycle state of an in-memory task.
///
/// ```text
/// Pending ──► Running ──► Completed
///    │           ├──────► Failed
///    │           ├──────► TimedOut
///    │           ├──────► Cancelled
///    │           └──────► Pending   (retry)
///    ├──────► Failed                (no executor)
///    └──────► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::TimedOut
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match self {
            Pending => matches!(next, Running | Failed | Cancelled),
            Running => matches!(next, Completed | Failed | Pending | Cancelled | TimedOut),
            Completed | Failed | Cancelled | TimedOut => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskOptions
// ---------------------------------------------------------------------------

/// Per-task overrides for [`TaskQueue::add_task`](super::TaskQueue::add_task).
///
/// Any field left as `None` falls back to the queue's configured default.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub id: Option<TaskId>,
    pub priority: Option<i32>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub retry_delay: Option<Duration>,
}

impl TaskOptions {
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A queued unit of work.
///
/// The payload and result are type-erased JSON; executors decode them.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub payload: serde_json::Value,
    /// Higher dispatches first; ties break by arrival order.
    pub priority: i32,
    pub state: TaskState,
    /// Number of times the executor has been invoked.
    pub attempts: u32,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl Task {
    /// Total attempts the task may consume before it is failed for good.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Move to `next`, enforcing the lifecycle graph.
    ///
    /// Returns `false` (and leaves the task untouched) for an illegal edge.
    pub(crate) fn transition(&mut self, next: TaskState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::error!(
                task_id = %self.id,
                from = %self.state,
                to = %next,
                "Rejected illegal task state transition",
            );
            return false;
        }
        self.state = next;
        let now = chrono::Utc::now();
        match next {
            TaskState::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
