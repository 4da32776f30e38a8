//! Tagged-variant event bus.
//!
//! Listeners subscribe to one topic or to all of them and are invoked in
//! registration order. Delivery happens on the emitting thread; the
//! subscriber list is snapshotted first, so a listener may subscribe or
//! unsubscribe from inside a callback without deadlocking. A panicking
//! listener is logged and skipped; later listeners still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An event that belongs to exactly one topic.
pub trait Topical {
    type Topic: Copy + Eq + Send + Sync;
    fn topic(&self) -> Self::Topic;
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscriber<E: Topical> {
    id: ListenerId,
    topic: Option<E::Topic>,
    callback: Callback<E>,
}

impl<E: Topical> Clone for Subscriber<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            topic: self.topic,
            callback: self.callback.clone(),
        }
    }
}

pub struct EventBus<E: Topical> {
    subscribers: Mutex<Vec<Subscriber<E>>>,
    next_id: AtomicU64,
}

impl<E: Topical> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Topical> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` for `topic`, or for every topic when `None`.
    pub fn subscribe<F>(&self, topic: Option<E::Topic>, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push(Subscriber {
            id,
            topic,
            callback: Arc::new(callback),
        });
        id
    }

    /// Returns false if the listener was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every matching subscriber. Returns how many
    /// returned normally.
    pub fn emit(&self, event: &E) -> usize {
        let topic = event.topic();
        let snapshot: Vec<Subscriber<E>> = self.subscribers.lock().clone();
        let mut delivered = 0;
        for sub in snapshot {
            if !sub.topic.map_or(true, |t| t == topic) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (sub.callback)(event))) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::error!(listener = sub.id.0, "event listener panicked"),
            }
        }
        delivered
    }
}
