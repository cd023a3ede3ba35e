//! In-process task queue.
//!
//! Tasks are dispatched highest priority first (FIFO among equals) to the
//! executor registered for their [`TaskKind`], with at most
//! `max_concurrent` attempts outstanding at a time. Transient failures are
//! retried after a fixed delay; attempts that overrun their time-out are
//! marked [`TaskState::TimedOut`] and never retried.
//!
//! The queue holds no durable state. Callers that need persistence keep
//! their own record keyed by the same [`TaskId`].

mod error;
mod event;
mod executor;
mod task;
mod task_queue;

pub use error::TaskError;
pub use event::{QueueCounters, TaskEvent};
pub use executor::{TaskContext, TaskExecutor};
pub use task::{Task, TaskId, TaskKind, TaskOptions, TaskState};
pub use task_queue::{QueueConfig, QueueHooks, QueueSnapshot, TaskHook, TaskQueue};
