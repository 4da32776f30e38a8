//! Ordered timer queue for synchronized actions.
//!
//! Actions are keyed by `(target_ms, seq)` so equal targets fire in
//! scheduling order. Firing pops the entry under the queue lock and
//! cancellation removes it under the same lock: whichever happens first
//! wins, and an action runs at most once.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Longest the run loop sleeps before re-reading the clock. Bounds how late
/// an action fires after the offset jumps forward.
const MAX_SLEEP: Duration = Duration::from_millis(50);

type Key = (i64, u64);

struct Queue {
    pending: Mutex<BTreeMap<Key, Action>>,
    seq: AtomicU64,
    wake: Notify,
}

#[derive(Clone)]
pub struct Scheduler {
    queue: Arc<Queue>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned by [`Scheduler::schedule`].
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    key: Option<Key>,
    queue: Weak<Queue>,
}

impl ScheduleHandle {
    fn fired() -> Self {
        Self {
            key: None,
            queue: Weak::new(),
        }
    }

    /// Remove the action if it has not fired. Returns true if this call
    /// cancelled it.
    pub fn cancel(&self) -> bool {
        let (Some(key), Some(queue)) = (self.key, self.queue.upgrade()) else {
            return false;
        };
        let removed = queue.pending.lock().remove(&key);
        removed.is_some()
    }

    /// Target time in corrected milliseconds, if the action was queued.
    pub fn target_ms(&self) -> Option<i64> {
        self.key.map(|(t, _)| t)
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(Queue {
                pending: Mutex::new(BTreeMap::new()),
                seq: AtomicU64::new(0),
                wake: Notify::new(),
            }),
        }
    }

    /// Queue `action` for `target_ms`. If the target is not in the future
    /// the action runs now, on the caller's thread, before this returns.
    /// Queued actions that are already due run around it in target order.
    pub fn schedule(&self, now_ms: i64, target_ms: i64, action: Action) -> ScheduleHandle {
        if target_ms <= now_ms {
            self.run_due(target_ms);
            run_guarded(action, target_ms);
            self.run_due(now_ms);
            return ScheduleHandle::fired();
        }

        let key = (target_ms, self.queue.seq.fetch_add(1, Ordering::Relaxed));
        self.queue.pending.lock().insert(key, action);
        self.queue.wake.notify_one();

        ScheduleHandle {
            key: Some(key),
            queue: Arc::downgrade(&self.queue),
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.pending.lock().len()
    }

    /// Pop and run every action due at `now_ms`, in target order.
    /// Returns how many ran.
    pub fn run_due(&self, now_ms: i64) -> usize {
        let mut ran = 0;
        loop {
            // Pop one at a time; the lock is not held while the action runs.
            let next = {
                let mut pending = self.queue.pending.lock();
                match pending.first_key_value() {
                    Some((&(target, _), _)) if target <= now_ms => pending.pop_first(),
                    _ => None,
                }
            };
            let Some(((target, _), action)) = next else {
                break;
            };
            run_guarded(action, target);
            ran += 1;
        }
        ran
    }

    fn next_target(&self) -> Option<i64> {
        self.queue.pending.lock().first_key_value().map(|(&(t, _), _)| t)
    }

    /// Fire queued actions as `now` reaches their targets until shutdown.
    pub async fn run<F>(self, now: F, mut shutdown: broadcast::Receiver<()>)
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        loop {
            self.run_due(now());

            let sleep = match self.next_target() {
                Some(target) => {
                    let wait = (target - now()).max(0) as u64;
                    Duration::from_millis(wait).min(MAX_SLEEP)
                }
                None => MAX_SLEEP,
            };

            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(pending = self.pending(), "scheduler shutting down");
                    return;
                }
                _ = self.queue.wake.notified() => {}
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }
}

fn run_guarded(action: Action, target_ms: i64) {
    if catch_unwind(AssertUnwindSafe(action)).is_err() {
        tracing::error!(target_ms, "scheduled action panicked");
    }
}
