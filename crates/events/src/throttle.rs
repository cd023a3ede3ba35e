//! Per-room leading/trailing-edge throttle with a bounded slot cache.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Outcome of offering an update to the throttle.
#[derive(Debug, PartialEq)]
pub(crate) enum Offer<T> {
    /// Interval elapsed; send this value now.
    EmitNow(T),
    /// Stored as the trailing update. `schedule` is set when the caller must
    /// arm a flush timer for `flush_at`; a timer is already pending otherwise.
    Deferred { flush_at: Instant, schedule: bool },
}

/// What a firing flush timer should do.
#[derive(Debug, PartialEq)]
pub(crate) enum Flush<T> {
    Emit(T),
    /// Sleep again until this instant.
    Rearm(Instant),
    Nothing,
}

struct Slot<T> {
    last_emit: Option<Instant>,
    pending: Option<T>,
    flush_scheduled: bool,
    last_touched: Instant,
}

impl<T> Slot<T> {
    fn new(now: Instant) -> Self {
        Self {
            last_emit: None,
            pending: None,
            flush_scheduled: false,
            last_touched: now,
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_none() && !self.flush_scheduled
    }
}

pub(crate) struct ThrottleCache<T> {
    interval: Duration,
    capacity: usize,
    ttl: Duration,
    slots: HashMap<String, Slot<T>>,
}

impl<T> ThrottleCache<T> {
    pub(crate) fn new(interval: Duration, capacity: usize, ttl: Duration) -> Self {
        Self {
            interval,
            capacity: capacity.max(1),
            ttl,
            slots: HashMap::new(),
        }
    }

    /// Offer `value` for `key`. The first offer after a quiet interval is
    /// emitted immediately; later ones within the interval replace the
    /// stored trailing value.
    pub(crate) fn offer(&mut self, key: &str, value: T, now: Instant) -> Offer<T> {
        if !self.slots.contains_key(key) {
            self.evict(now);
        }
        let interval = self.interval;
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Slot::new(now));
        slot.last_touched = now;

        match slot.last_emit {
            Some(last) if now.duration_since(last) < interval => {
                slot.pending = Some(value);
                let schedule = !slot.flush_scheduled;
                slot.flush_scheduled = true;
                Offer::Deferred {
                    flush_at: last + interval,
                    schedule,
                }
            }
            _ => {
                // A newer value supersedes any trailing one still waiting.
                slot.pending = None;
                slot.last_emit = Some(now);
                Offer::EmitNow(value)
            }
        }
    }

    /// Called by the flush timer when it fires.
    pub(crate) fn take_due(&mut self, key: &str, now: Instant) -> Flush<T> {
        let interval = self.interval;
        let Some(slot) = self.slots.get_mut(key) else {
            return Flush::Nothing;
        };
        if slot.pending.is_none() {
            slot.flush_scheduled = false;
            return Flush::Nothing;
        }
        // An unthrottled emission restarted the interval after this timer
        // was armed.
        if let Some(last) = slot.last_emit {
            if now.duration_since(last) < interval {
                return Flush::Rearm(last + interval);
            }
        }
        slot.flush_scheduled = false;
        slot.last_emit = Some(now);
        slot.last_touched = now;
        match slot.pending.take() {
            Some(value) => Flush::Emit(value),
            None => Flush::Nothing,
        }
    }

    /// Take the trailing value ahead of an unthrottled emission so it is
    /// delivered first. The slot's interval restarts at `now`.
    pub(crate) fn flush_now(&mut self, key: &str, now: Instant) -> Option<T> {
        let slot = self.slots.get_mut(key)?;
        slot.last_emit = Some(now);
        slot.last_touched = now;
        slot.pending.take()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Drop idle slots past the TTL, then least-recently-touched idle slots
    /// until there is room for one more.
    fn evict(&mut self, now: Instant) {
        let ttl = self.ttl;
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| !slot.is_idle() || now.duration_since(slot.last_touched) < ttl);

        while self.slots.len() >= self.capacity {
            let oldest = self
                .slots
                .iter()
                .filter(|(_, slot)| slot.is_idle())
                .min_by_key(|(_, slot)| slot.last_touched)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.slots.remove(&key);
                }
                None => break,
            }
        }

        let evicted = before - self.slots.len();
        if evicted > 0 {
            tracing::warn!(evicted, remaining = self.slots.len(), "Evicted throttle slots");
        }
    }
}
