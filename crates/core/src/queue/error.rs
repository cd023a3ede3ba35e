//! Executor failure classification.
//!
//! Executors return `Result<Value, TaskError>`; the dispatcher switches on
//! the variant to decide between retry, failure and time-out.

use std::time::Duration;

use super::task::TaskKind;

/// Why an attempt did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Bad or missing input. Never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No executor is registered for the task's kind. Never retried.
    #[error("No executor registered for task kind '{0}'")]
    NoExecutor(TaskKind),

    /// Network or upstream 5xx failure. Retried within the task's budget.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The work was attempted and definitively rejected. Never retried.
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// The executor or one of its calls exceeded its deadline.
    /// Moves the task to `TimedOut`; never retried.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// A dependency is known to be down (e.g. an open circuit breaker).
    /// Fails fast without retry.
    #[error("Dependency unavailable: {0}")]
    Unavailable(String),

    /// The executor observed cancellation and stopped early.
    #[error("Cancelled")]
    Cancelled,

    /// The executor panicked or hit an unexpected condition.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Only transient failures consume the retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Transient(_))
    }

    /// Short machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            TaskError::Validation(_) => "VALIDATION",
            TaskError::NoExecutor(_) => "NO_EXECUTOR",
            TaskError::Transient(_) => "TRANSIENT",
            TaskError::Permanent(_) => "PERMANENT",
            TaskError::Timeout(_) => "TIMEOUT",
            TaskError::Unavailable(_) => "UNAVAILABLE",
            TaskError::Cancelled => "CANCELLED",
            TaskError::Internal(_) => "INTERNAL",
        }
    }
}
