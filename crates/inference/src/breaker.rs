//! Rolling-window circuit breaker.
//!
//! ```text
//! CLOSED ──(threshold reached in window)──► OPEN
//!   ▲                                        │ reset_timeout elapsed,
//!   │                                        ▼ next call is the trial
//!   └────────(trial succeeds)──────────── HALF_OPEN ──(trial fails)──► OPEN
//! ```
//!
//! The breaker opens when the failures recorded inside the rolling window
//! reach `failure_threshold`, or when at least `volume_threshold` calls are
//! in the window and their failure percentage reaches `error_percentage`.
//! While open every call is rejected without invoking the wrapped future.
//! Exactly one trial call is admitted once `reset_timeout` has elapsed.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::BreakerConfig;

/// Capacity of the transition channel created by [`CircuitBreaker::new`].
const TRANSITION_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published on every state change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerTransition {
    pub name: String,
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Counters since construction plus the current window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    /// Every call, including rejected ones.
    pub fires: u64,
    pub failures: u64,
    pub successes: u64,
    pub timeouts: u64,
    pub fallbacks: u64,
    /// Calls refused because the breaker was open.
    pub rejects: u64,
    pub window_volume: usize,
    pub window_failures: usize,
}

/// Why a wrapped call did not return a value.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// Rejected without invoking the call.
    Open,
    /// The call exceeded the breaker's per-call timeout.
    Timeout(Duration),
    /// The call itself failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open => f.write_str("circuit breaker is open"),
            BreakerError::Timeout(after) => write!(f, "call timed out after {after:?}"),
            BreakerError::Inner(e) => e.fmt(f),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

#[derive(Default)]
struct Counters {
    fires: u64,
    failures: u64,
    successes: u64,
    timeouts: u64,
    fallbacks: u64,
    rejects: u64,
}

struct BreakerInner {
    state: BreakerState,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// `(recorded_at, failed)` for calls inside the rolling window.
    window: VecDeque<(Instant, bool)>,
    counters: Counters,
}

/// Releases the half-open trial slot if the trial future is dropped
/// before it reports an outcome.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.inner();
            if inner.state == BreakerState::HalfOpen {
                inner.trial_in_flight = false;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self::with_events(name, config, events)
    }

    /// Publish transitions on a shared channel.
    pub fn with_events(
        name: impl Into<String>,
        config: BreakerConfig,
        events: broadcast::Sender<BreakerTransition>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                opened_at: None,
                trial_in_flight: false,
                window: VecDeque::new(),
                counters: Counters::default(),
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        self.inner().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner();
        self.prune(&mut inner, Instant::now());
        let c = &inner.counters;
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            fires: c.fires,
            failures: c.failures,
            successes: c.successes,
            timeouts: c.timeouts,
            fallbacks: c.fallbacks,
            rejects: c.rejects,
            window_volume: inner.window.len(),
            window_failures: inner.window.iter().filter(|(_, failed)| *failed).count(),
        }
    }

    /// Invoke `f` through the breaker. Every error counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| true).await
    }

    /// Invoke `f` through the breaker, counting only errors for which
    /// `is_failure` returns true. Other errors are passed through and
    /// recorded as healthy responses.
    pub async fn call_classified<F, Fut, T, E, P>(
        &self,
        f: F,
        is_failure: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let admission = self.admit().ok_or(BreakerError::Open)?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let outcome = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, f()).await {
                Ok(result) => result.map_err(BreakerError::Inner),
                Err(_) => Err(BreakerError::Timeout(limit)),
            },
            None => f().await.map_err(BreakerError::Inner),
        };

        let (failed, timed_out) = match &outcome {
            Ok(_) => (false, false),
            Err(BreakerError::Inner(e)) => (is_failure(e), false),
            Err(BreakerError::Timeout(_)) => (true, true),
            Err(BreakerError::Open) => (true, false),
        };
        guard.armed = false;
        self.record(admission, failed, timed_out);
        outcome
    }

    /// Like [`call`](Self::call), but maps any error through `fallback`.
    pub async fn call_with_fallback<F, Fut, T, E, FB>(&self, f: F, fallback: FB) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(BreakerError<E>) -> T,
    {
        match self.call(f).await {
            Ok(value) => value,
            Err(err) => {
                self.inner().counters.fallbacks += 1;
                fallback(err)
            }
        }
    }

    // ---- private helpers ----

    fn inner(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a call may proceed.
    fn admit(&self) -> Option<Admission> {
        let now = Instant::now();
        let mut inner = self.inner();
        inner.counters.fires += 1;

        let state = inner.state;
        match state {
            BreakerState::Closed => Some(Admission::Normal),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map_or(self.config.reset_timeout, |at| now.duration_since(at));
                if elapsed < self.config.reset_timeout {
                    inner.counters.rejects += 1;
                    return None;
                }
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                drop(inner);
                self.publish(BreakerState::Open, BreakerState::HalfOpen);
                Some(Admission::Trial)
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.counters.rejects += 1;
                    None
                } else {
                    inner.trial_in_flight = true;
                    Some(Admission::Trial)
                }
            }
        }
    }

    fn record(&self, admission: Admission, failed: bool, timed_out: bool) {
        let now = Instant::now();
        let mut inner = self.inner();

        if failed {
            inner.counters.failures += 1;
        } else {
            inner.counters.successes += 1;
        }
        if timed_out {
            inner.counters.timeouts += 1;
        }
        inner.window.push_back((now, failed));
        self.prune(&mut inner, now);

        let from = inner.state;
        let to = match admission {
            Admission::Trial => {
                inner.trial_in_flight = false;
                if failed {
                    Some(BreakerState::Open)
                } else {
                    Some(BreakerState::Closed)
                }
            }
            Admission::Normal => {
                (from == BreakerState::Closed && failed && self.should_open(&inner))
                    .then_some(BreakerState::Open)
            }
        };

        let Some(to) = to else {
            return;
        };
        match to {
            BreakerState::Open => {
                inner.opened_at = Some(now);
            }
            BreakerState::Closed => {
                inner.opened_at = None;
                inner.window.clear();
            }
            BreakerState::HalfOpen => {}
        }
        inner.state = to;
        drop(inner);

        if from != to {
            self.publish(from, to);
        }
    }

    fn should_open(&self, inner: &BreakerInner) -> bool {
        let volume = inner.window.len();
        let failures = inner.window.iter().filter(|(_, failed)| *failed).count();

        if failures >= self.config.failure_threshold as usize {
            return true;
        }
        volume > 0
            && volume >= self.config.volume_threshold as usize
            && failures * 100 >= usize::from(self.config.error_percentage) * volume
    }

    fn prune(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some((at, _)) = inner.window.front() {
            if now.duration_since(*at) < self.config.rolling_window {
                break;
            }
            inner.window.pop_front();
        }
    }

    fn publish(&self, from: BreakerState, to: BreakerState) {
        match to {
            BreakerState::Open => {
                tracing::warn!(breaker = %self.name, %from, %to, "Circuit breaker opened");
            }
            _ => tracing::info!(breaker = %self.name, %from, %to, "Circuit breaker state changed"),
        }
        // A send error only means there are no subscribers.
        let _ = self.events.send(BreakerTransition {
            name: self.name.clone(),
            from,
            to,
            at: chrono::Utc::now(),
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
