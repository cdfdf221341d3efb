//! Transaction Timers
//!
//! Every state machine owns at most one outstanding timer. Rather than storing
//! callbacks, a timer carries the [`TransactionKey`] of its owner; when it
//! expires the host hands the handle and key back to
//! [`on_timeout`](crate::StateMachineAccessPoint::on_timeout),
//! which ignores handles that have since been replaced.
//!
//! [`TimerQueue`] is a delay queue driven by an external clock. Tests advance
//! it by hand; the async driver feeds it the elapsed wall-clock time.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::transaction::TransactionKey;

/// Identifies one scheduled timer; never reused by a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Single-shot delayed event service
pub trait Scheduler {
    /// Arrange for `key` to be reported after `after` has elapsed
    fn schedule(&mut self, after: Duration, key: TransactionKey) -> TimerHandle;

    /// Forget a timer; cancelling an expired or unknown handle is a no-op
    fn cancel(&mut self, handle: TimerHandle);
}

/// Ordered delay queue with a caller-driven clock
#[derive(Debug, Default)]
pub struct TimerQueue {
    now: Duration,
    next_handle: u64,
    pending: BTreeMap<(Duration, TimerHandle), TransactionKey>,
    deadlines: HashMap<TimerHandle, Duration>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time of the queue's clock
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Move the clock forward; the clock never runs backwards
    pub fn set_now(&mut self, now: Duration) {
        if now > self.now {
            self.now = now;
        }
    }

    /// Deadline of the earliest pending timer
    pub fn next_deadline(&self) -> Option<Duration> {
        self.pending.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove the earliest timer due at or before `until`, moving the clock to
    /// its deadline
    pub fn pop_expired(&mut self, until: Duration) -> Option<(TimerHandle, TransactionKey)> {
        let (&(deadline, handle), _) = self.pending.iter().next()?;
        if deadline > until {
            return None;
        }
        let key = self.pending.remove(&(deadline, handle))?;
        self.deadlines.remove(&handle);
        self.set_now(deadline);
        Some((handle, key))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Scheduler for TimerQueue {
    fn schedule(&mut self, after: Duration, key: TransactionKey) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        let deadline = self.now + after;
        self.pending.insert((deadline, handle), key);
        self.deadlines.insert(handle, deadline);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if let Some(deadline) = self.deadlines.remove(&handle) {
            self.pending.remove(&(deadline, handle));
        }
    }
}
