//! Registry of change listeners attached to a document actor.
//!
//! A listener is an unbounded channel sender plus caller-supplied metadata.
//! The channel doubles as the liveness link: once the receiving half is
//! dropped the entry is pruned on the next delivery.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;

/// Handle identifying one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

struct Observer<T> {
    sink: UnboundedSender<T>,
    metadata: Value,
}

/// Listeners for one event kind, delivered in registration order.
pub struct SubscriptionRegistry<T> {
    observers: BTreeMap<SubscriptionId, Observer<T>>,
    next_id: u64,
}

impl<T> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SubscriptionRegistry<T> {
    pub fn new() -> Self {
        Self {
            observers: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn register(&mut self, sink: UnboundedSender<T>, metadata: Value) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.observers.insert(id, Observer { sink, metadata });
        id
    }

    /// Remove a registration. Unknown or already removed ids are a no-op;
    /// the return value reports whether anything was removed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.remove(&id).is_some()
    }

    /// Send one event per live listener, built from that listener's metadata.
    /// Listeners whose receiver is gone are dropped. Returns the delivery count.
    pub fn deliver<F>(&mut self, mut build: F) -> usize
    where
        F: FnMut(&Value) -> T,
    {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, observer) in &self.observers {
            if observer.sink.is_closed() || observer.sink.send(build(&observer.metadata)).is_err() {
                dead.push(*id);
            } else {
                delivered += 1;
            }
        }
        for id in dead {
            log::debug!("pruning dead subscription {id}");
            self.observers.remove(&id);
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}
