//! The dispatcher: priority ordering, bounded concurrency, retries and
//! time-outs.
//!
//! All bookkeeping (pending list, running set, delayed retries) lives behind
//! a single mutex that is never held across an `.await`. Executors run on
//! their own Tokio tasks; a supervising task races each attempt against its
//! time-out and cancellation token and reports back through [`Inner::settle`].
//! Results are only accepted from the attempt currently recorded in the
//! running set, so a late result of a cancelled or timed-out attempt is
//! dropped.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;

use super::error::TaskError;
use super::event::{QueueCounters, TaskEvent};
use super::executor::{TaskContext, TaskExecutor};
use super::task::{Task, TaskId, TaskKind, TaskOptions, TaskState};

/// Default buffer capacity for the lifecycle event channel.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Queue-wide limits and per-task defaults.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Upper bound on outstanding executor invocations.
    pub max_concurrent: usize,
    pub default_priority: i32,
    pub default_retries: u32,
    pub default_retry_delay: Duration,
    pub default_timeout: Duration,
    /// Capacity of the broadcast channel behind [`TaskQueue::subscribe`].
    pub event_capacity: usize,
    /// Start dispatching immediately on construction.
    pub auto_start: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            default_priority: 0,
            default_retries: 2,
            default_retry_delay: Duration::from_secs(5),
            default_timeout: Duration::from_secs(330),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            auto_start: true,
        }
    }
}

/// Callback invoked with the terminal snapshot of a task.
pub type TaskHook = Arc<dyn Fn(&Task) + Send + Sync>;

/// Optional completion/error callbacks.
///
/// Hooks run outside the queue lock, so they may call back into the queue.
#[derive(Clone, Default)]
pub struct QueueHooks {
    on_complete: Option<TaskHook>,
    on_error: Option<TaskHook>,
}

impl QueueHooks {
    pub fn on_complete(mut self, hook: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub queue_length: usize,
    pub running_count: usize,
    pub max_concurrent: usize,
    pub delayed_count: usize,
    /// Pending ids in dispatch order.
    pub pending_ids: Vec<TaskId>,
    pub running_ids: Vec<TaskId>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Orders by descending priority, then ascending arrival sequence.
type PendingKey = (Reverse<i32>, u64);

struct RunningSlot {
    attempt: u32,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    started: bool,
    next_seq: u64,
    /// Every non-terminal task.
    tasks: HashMap<TaskId, Task>,
    pending: BTreeMap<PendingKey, TaskId>,
    running: HashMap<TaskId, RunningSlot>,
    /// Pending tasks sleeping out their retry delay.
    delayed: HashSet<TaskId>,
}

impl QueueState {
    fn enqueue(&mut self, id: TaskId, priority: i32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert((Reverse(priority), seq), id);
    }

    fn counters(&self, max_concurrent: usize) -> QueueCounters {
        QueueCounters {
            pending: self.pending.len(),
            running: self.running.len(),
            delayed: self.delayed.len(),
            max_concurrent,
        }
    }
}

/// How an attempt ended, as seen by the supervisor.
enum AttemptOutcome {
    Finished(Result<serde_json::Value, TaskError>),
    TimedOut(Duration),
}

enum HookCall {
    Complete(Task),
    Error(Task),
}

struct Inner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    executors: RwLock<HashMap<TaskKind, Arc<dyn TaskExecutor>>>,
    events: broadcast::Sender<TaskEvent>,
    /// Receives time-outs and missing-executor failures without loss.
    verdicts: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    hooks: QueueHooks,
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

/// In-process priority queue with bounded concurrency.
///
/// Cheap to clone; all clones share one queue. Methods that may dispatch
/// (`add_task`, `start`, `cancel_task`) must be called from within a Tokio
/// runtime.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_hooks(config, QueueHooks::default())
    }

    pub fn with_hooks(config: QueueConfig, hooks: QueueHooks) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let state = QueueState {
            started: config.auto_start,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                executors: RwLock::new(HashMap::new()),
                events,
                verdicts: Mutex::new(None),
                hooks,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Subscribe to lifecycle events.
    ///
    /// Slow receivers observe `RecvError::Lagged` once the channel is full.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Terminal snapshots of tasks the queue settled on its own: time-outs
    /// and failures for want of an executor.
    ///
    /// Unlike [`subscribe`](Self::subscribe) this channel never drops a
    /// snapshot. Only one receiver is live; calling again replaces it.
    pub fn verdicts(&self) -> mpsc::UnboundedReceiver<Task> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .inner
            .verdicts
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    // ---- executor registry ----

    /// Bind `executor` to `kind`. Exactly one executor per kind.
    pub fn register_executor(
        &self,
        kind: TaskKind,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<(), CoreError> {
        let mut executors = self.inner.executors();
        if executors.contains_key(&kind) {
            return Err(CoreError::Conflict(format!(
                "An executor is already registered for task kind '{kind}'"
            )));
        }
        tracing::info!(kind = %kind, "Registered task executor");
        executors.insert(kind, executor);
        Ok(())
    }

    /// Remove the executor for `kind`. Returns whether one was registered.
    pub fn unregister_executor(&self, kind: &TaskKind) -> bool {
        let removed = self.inner.executors().remove(kind).is_some();
        if removed {
            tracing::info!(kind = %kind, "Unregistered task executor");
        }
        removed
    }

    pub fn has_executor(&self, kind: &TaskKind) -> bool {
        self.inner.executors_read().contains_key(kind)
    }

    /// Fail fast at startup if any expected kind has no executor.
    pub fn ensure_executors(&self, expected: &[TaskKind]) -> Result<(), CoreError> {
        let executors = self.inner.executors_read();
        let missing: Vec<&str> = expected
            .iter()
            .filter(|k| !executors.contains_key(*k))
            .map(TaskKind::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Validation(format!(
                "No executor registered for task kinds: {missing:?}"
            )))
        }
    }

    // ---- task operations ----

    /// Enqueue a task and dispatch if the queue is started.
    ///
    /// Returns the task as it stands after the dispatch pass, so a task
    /// that found a free slot is already `Running` and one without an
    /// executor is already `Failed`.
    pub fn add_task(
        &self,
        kind: TaskKind,
        payload: serde_json::Value,
        options: TaskOptions,
    ) -> Result<Task, CoreError> {
        let defaults = &self.inner.config;
        let id = options.id.unwrap_or_else(TaskId::new_v4);
        let task = Task {
            id,
            kind,
            payload,
            priority: options.priority.unwrap_or(defaults.default_priority),
            state: TaskState::Pending,
            attempts: 0,
            max_retries: options.retries.unwrap_or(defaults.default_retries),
            retry_delay: options.retry_delay.unwrap_or(defaults.default_retry_delay),
            timeout: options.timeout.unwrap_or(defaults.default_timeout),
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            result: None,
        };

        {
            let mut state = self.inner.state();
            if state.tasks.contains_key(&id) {
                return Err(CoreError::Conflict(format!("Task {id} is already queued")));
            }
            state.enqueue(id, task.priority);
            state.tasks.insert(id, task.clone());
            tracing::debug!(task_id = %id, kind = %task.kind, priority = task.priority, "Task added");
            self.inner.emit(TaskEvent::Added(task.clone()));
            self.inner
                .emit(TaskEvent::QueueUpdated(state.counters(defaults.max_concurrent)));
        }

        let mut dispatched = self.inner.dispatch();
        let after = match dispatched.iter().position(|t| t.id == id) {
            Some(index) => dispatched.swap_remove(index),
            None => self.get_task(id).unwrap_or(task),
        };
        Ok(after)
    }

    /// Cancel a pending or running task.
    ///
    /// A running attempt is abandoned, not interrupted: its cancellation
    /// token is signalled and any result it later produces is ignored.
    /// Returns `false` if the id is neither pending nor running.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        let cancelled = {
            let mut state = self.inner.state();
            let cancelled = self.inner.cancel_locked(&mut state, id);
            if cancelled {
                self.inner
                    .emit(TaskEvent::QueueUpdated(state.counters(self.inner.config.max_concurrent)));
            }
            cancelled
        };
        if cancelled {
            self.inner.dispatch();
        }
        cancelled
    }

    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.inner.state().tasks.get(&id).cloned()
    }

    /// Pending tasks in dispatch order, followed by tasks waiting out a
    /// retry delay.
    pub fn pending_tasks(&self) -> Vec<Task> {
        let state = self.inner.state();
        let queued = state.pending.values();
        let delayed = state.delayed.iter();
        queued
            .chain(delayed)
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    pub fn running_tasks(&self) -> Vec<Task> {
        let state = self.inner.state();
        state
            .running
            .keys()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state();
        QueueSnapshot {
            queue_length: state.pending.len(),
            running_count: state.running.len(),
            max_concurrent: self.inner.config.max_concurrent,
            delayed_count: state.delayed.len(),
            pending_ids: state.pending.values().copied().collect(),
            running_ids: state.running.keys().copied().collect(),
        }
    }

    // ---- lifecycle ----

    /// Resume dispatching.
    pub fn start(&self) {
        {
            let mut state = self.inner.state();
            if state.started {
                return;
            }
            state.started = true;
            tracing::info!("Task queue started");
            self.inner.emit(TaskEvent::QueueStarted);
        }
        self.inner.dispatch();
    }

    /// Stop dispatching new work. Running tasks are left to finish.
    pub fn stop(&self) {
        let mut state = self.inner.state();
        if !state.started {
            return;
        }
        state.started = false;
        tracing::info!(running = state.running.len(), "Task queue stopped");
        self.inner.emit(TaskEvent::QueueStopped);
    }

    pub fn is_started(&self) -> bool {
        self.inner.state().started
    }

    /// Cancel everything pending, delayed and running.
    pub fn clear(&self) -> usize {
        let mut state = self.inner.state();
        let ids: Vec<TaskId> = state.tasks.keys().copied().collect();
        let cancelled = ids
            .into_iter()
            .filter(|id| self.inner.cancel_locked(&mut state, *id))
            .count();
        tracing::info!(cancelled, "Task queue cleared");
        self.inner.emit(TaskEvent::QueueCleared { cancelled });
        self.inner
            .emit(TaskEvent::QueueUpdated(state.counters(self.inner.config.max_concurrent)));
        cancelled
    }
}

// ---------------------------------------------------------------------------
// Dispatch internals
// ---------------------------------------------------------------------------

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn executors(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TaskKind, Arc<dyn TaskExecutor>>> {
        self.executors.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn executors_read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<TaskKind, Arc<dyn TaskExecutor>>> {
        self.executors.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TaskEvent) {
        // A send error only means there are no subscribers.
        let _ = self.events.send(event);
    }

    fn verdict(&self, task: &Task) {
        let verdicts = self.verdicts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = verdicts.as_ref() {
            if tx.send(task.clone()).is_err() {
                tracing::warn!(task_id = %task.id, "Verdict receiver dropped");
            }
        }
    }

    fn run_hooks(&self, calls: Vec<HookCall>) {
        for call in calls {
            match call {
                HookCall::Complete(task) => {
                    if let Some(hook) = &self.hooks.on_complete {
                        hook(&task);
                    }
                }
                HookCall::Error(task) => {
                    if let Some(hook) = &self.hooks.on_error {
                        hook(&task);
                    }
                }
            }
        }
    }

    /// Start as many pending tasks as free slots allow. Returns the
    /// snapshots of the tasks this pass started or failed.
    fn dispatch(self: &Arc<Self>) -> Vec<Task> {
        let mut hooks = Vec::new();
        let mut touched = Vec::new();
        {
            let mut state = self.state();
            if !state.started {
                return touched;
            }

            let mut changed = false;
            while state.running.len() < self.config.max_concurrent {
                let Some((_, id)) = state.pending.pop_first() else {
                    break;
                };
                changed = true;

                let Some(task) = state.tasks.get(&id) else {
                    continue;
                };
                let executor = self.executors_read().get(&task.kind).cloned();

                let Some(executor) = executor else {
                    let Some(mut task) = state.tasks.remove(&id) else {
                        continue;
                    };
                    let err = TaskError::NoExecutor(task.kind.clone());
                    tracing::warn!(task_id = %id, kind = %task.kind, "No executor for task kind");
                    task.error = Some(err.to_string());
                    task.transition(TaskState::Failed);
                    self.emit(TaskEvent::Failed(task.clone()));
                    self.verdict(&task);
                    touched.push(task.clone());
                    hooks.push(HookCall::Error(task));
                    continue;
                };

                let cancel = CancellationToken::new();
                let Some(task) = state.tasks.get_mut(&id) else {
                    continue;
                };
                if !task.transition(TaskState::Running) {
                    continue;
                }
                task.attempts += 1;

                let ctx = TaskContext {
                    id,
                    kind: task.kind.clone(),
                    payload: task.payload.clone(),
                    attempt: task.attempts,
                    max_attempts: task.max_attempts(),
                    cancel: cancel.clone(),
                };
                let timeout = task.timeout;
                let started = task.clone();

                state.running.insert(
                    id,
                    RunningSlot {
                        attempt: ctx.attempt,
                        cancel: cancel.clone(),
                    },
                );
                tracing::debug!(task_id = %id, attempt = ctx.attempt, "Task started");
                self.emit(TaskEvent::Started(started.clone()));
                touched.push(started);
                self.spawn_attempt(executor, ctx, timeout, cancel);
            }

            if changed {
                self.emit(TaskEvent::QueueUpdated(state.counters(self.config.max_concurrent)));
            }
        }
        self.run_hooks(hooks);
        touched
    }

    /// Run one attempt on its own task, supervised for time-out and
    /// cancellation.
    fn spawn_attempt(
        self: &Arc<Self>,
        executor: Arc<dyn TaskExecutor>,
        ctx: TaskContext,
        timeout: Duration,
        cancel: CancellationToken,
    ) {
        let inner = Arc::clone(self);
        let id = ctx.id;
        let attempt = ctx.attempt;

        let mut work = tokio::spawn(async move { executor.execute(ctx).await });

        tokio::spawn(async move {
            let outcome = tokio::select! {
                joined = &mut work => match joined {
                    Ok(result) => AttemptOutcome::Finished(result),
                    Err(e) => AttemptOutcome::Finished(Err(TaskError::Internal(format!(
                        "executor aborted: {e}"
                    )))),
                },
                _ = tokio::time::sleep(timeout) => AttemptOutcome::TimedOut(timeout),
                // cancel_task already settled the task.
                _ = cancel.cancelled() => return,
            };
            inner.settle(id, attempt, outcome);
        });
    }

    /// Apply the outcome of an attempt, then dispatch again.
    fn settle(self: &Arc<Self>, id: TaskId, attempt: u32, outcome: AttemptOutcome) {
        let mut hooks = Vec::new();
        {
            let mut state = self.state();
            let current = state.running.get(&id).map(|slot| slot.attempt);
            if current != Some(attempt) {
                tracing::debug!(task_id = %id, attempt, "Ignoring result of abandoned attempt");
                return;
            }
            let Some(slot) = state.running.remove(&id) else {
                return;
            };

            let outcome = match outcome {
                AttemptOutcome::Finished(Err(TaskError::Timeout(after))) => {
                    AttemptOutcome::TimedOut(after)
                }
                other => other,
            };

            match outcome {
                AttemptOutcome::Finished(Ok(value)) => {
                    if let Some(mut task) = state.tasks.remove(&id) {
                        task.result = Some(value);
                        task.transition(TaskState::Completed);
                        tracing::debug!(task_id = %id, attempt, "Task completed");
                        self.emit(TaskEvent::Completed(task.clone()));
                        hooks.push(HookCall::Complete(task));
                    }
                }
                AttemptOutcome::TimedOut(after) => {
                    slot.cancel.cancel();
                    if let Some(mut task) = state.tasks.remove(&id) {
                        task.error = Some(TaskError::Timeout(after).to_string());
                        task.transition(TaskState::TimedOut);
                        tracing::warn!(task_id = %id, attempt, timeout_ms = after.as_millis() as u64, "Task timed out");
                        self.verdict(&task);
                        self.emit(TaskEvent::TimedOut(task));
                    }
                }
                AttemptOutcome::Finished(Err(err)) => {
                    let retry = state
                        .tasks
                        .get(&id)
                        .is_some_and(|t| err.is_retryable() && t.attempts < t.max_attempts());

                    if retry {
                        if let Some(task) = state.tasks.get_mut(&id) {
                            task.error = Some(err.to_string());
                            task.transition(TaskState::Pending);
                            let delay = task.retry_delay;
                            tracing::warn!(
                                task_id = %id,
                                attempt,
                                max_attempts = task.max_attempts(),
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "Task failed, retry scheduled",
                            );
                            self.emit(TaskEvent::Retrying {
                                task: task.clone(),
                                delay,
                            });
                            state.delayed.insert(id);
                            self.schedule_requeue(id, delay);
                        }
                    } else if let Some(mut task) = state.tasks.remove(&id) {
                        task.error = Some(err.to_string());
                        task.transition(TaskState::Failed);
                        tracing::warn!(task_id = %id, attempt, error = %err, "Task failed");
                        self.emit(TaskEvent::Failed(task.clone()));
                        hooks.push(HookCall::Error(task));
                    }
                }
            }

            self.emit(TaskEvent::QueueUpdated(state.counters(self.config.max_concurrent)));
        }
        self.run_hooks(hooks);
        self.dispatch();
    }

    fn schedule_requeue(self: &Arc<Self>, id: TaskId, delay: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.requeue(id);
        });
    }

    /// Move a delayed retry back into the pending list.
    fn requeue(self: &Arc<Self>, id: TaskId) {
        {
            let mut state = self.state();
            // Cancelled while sleeping.
            if !state.delayed.remove(&id) {
                return;
            }
            let Some(priority) = state.tasks.get(&id).map(|t| t.priority) else {
                return;
            };
            state.enqueue(id, priority);
            self.emit(TaskEvent::QueueUpdated(state.counters(self.config.max_concurrent)));
        }
        self.dispatch();
    }

    /// Cancel `id` if it is pending, delayed or running.
    fn cancel_locked(&self, state: &mut QueueState, id: TaskId) -> bool {
        if let Some(slot) = state.running.remove(&id) {
            slot.cancel.cancel();
        } else if state.tasks.get(&id).is_some_and(|t| t.state == TaskState::Pending) {
            state.pending.retain(|_, pending_id| *pending_id != id);
            state.delayed.remove(&id);
        } else {
            return false;
        }

        let Some(mut task) = state.tasks.remove(&id) else {
            return false;
        };
        task.transition(TaskState::Cancelled);
        tracing::info!(task_id = %id, "Task cancelled");
        self.emit(TaskEvent::Cancelled(task));
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
