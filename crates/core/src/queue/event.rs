//! Typed lifecycle events published by the queue.

use std::time::Duration;

use serde::Serialize;

use super::task::{Task, TaskId};

/// Aggregate counters attached to [`TaskEvent::QueueUpdated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounters {
    pub pending: usize,
    pub running: usize,
    /// Tasks waiting out a retry delay before re-entering the pending list.
    pub delayed: usize,
    pub max_concurrent: usize,
}

/// A queue lifecycle notification.
///
/// Events are published on a bounded broadcast channel in the order the
/// queue applies the corresponding state changes.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Added(Task),
    Started(Task),
    Completed(Task),
    Failed(Task),
    Retrying { task: Task, delay: Duration },
    Cancelled(Task),
    TimedOut(Task),
    QueueUpdated(QueueCounters),
    QueueStarted,
    QueueStopped,
    QueueCleared { cancelled: usize },
}

impl TaskEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Added(_) => "task:added",
            TaskEvent::Started(_) => "task:started",
            TaskEvent::Completed(_) => "task:completed",
            TaskEvent::Failed(_) => "task:failed",
            TaskEvent::Retrying { .. } => "task:retrying",
            TaskEvent::Cancelled(_) => "task:cancelled",
            TaskEvent::TimedOut(_) => "task:timeout",
            TaskEvent::QueueUpdated(_) => "queue:updated",
            TaskEvent::QueueStarted => "queue:started",
            TaskEvent::QueueStopped => "queue:stopped",
            TaskEvent::QueueCleared { .. } => "queue:cleared",
        }
    }

    /// The task this event concerns, if any.
    pub fn task(&self) -> Option<&Task> {
        match self {
            TaskEvent::Added(t)
            | TaskEvent::Started(t)
            | TaskEvent::Completed(t)
            | TaskEvent::Failed(t)
            | TaskEvent::Cancelled(t)
            | TaskEvent::TimedOut(t) => Some(t),
            TaskEvent::Retrying { task, .. } => Some(task),
            _ => None,
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.task().map(|t| t.id)
    }
}
