//! Fan-out of encoded messages to the observers of one document.
//!
//! Each observer owns an unbounded channel keyed by its [`Origin`]. A message
//! caused by observer X is delivered to everyone except X. Channels whose
//! receiver was dropped are reported back so the hub can treat them as a
//! disconnect.
//!
//! Send is lock-free on the stats path; the observer map itself is owned by
//! the hub task and needs no lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::actor::Origin;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_observers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Result of one fan-out.
#[derive(Debug, Default)]
pub struct Delivery {
    /// Observers that received the message
    pub delivered: usize,
    /// Observers whose receiver is gone; already removed from the group
    pub dead: Vec<Origin>,
}

/// Observer set of a single document.
pub struct BroadcastGroup {
    observers: HashMap<Origin, mpsc::UnboundedSender<Arc<Vec<u8>>>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Default for BroadcastGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self {
            observers: HashMap::new(),
            stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register an observer and return its receiving end.
    ///
    /// An origin that is already registered gets a fresh channel; the old
    /// receiver sees end-of-stream.
    pub fn add_observer(&mut self, origin: Origin) -> mpsc::UnboundedReceiver<Arc<Vec<u8>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.insert(origin, tx);
        rx
    }

    pub fn remove_observer(&mut self, origin: &Origin) -> bool {
        self.observers.remove(origin).is_some()
    }

    pub fn has_observer(&self, origin: &Origin) -> bool {
        self.observers.contains_key(origin)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Send `encoded` to every observer except `exclude`.
    pub fn broadcast(&mut self, encoded: Arc<Vec<u8>>, exclude: Option<&Origin>) -> Delivery {
        let mut delivery = Delivery::default();
        for (origin, tx) in &self.observers {
            if Some(origin) == exclude {
                continue;
            }
            if tx.send(encoded.clone()).is_ok() {
                delivery.delivered += 1;
            } else {
                delivery.dead.push(*origin);
            }
        }

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        if !delivery.dead.is_empty() {
            self.stats
                .messages_dropped
                .fetch_add(delivery.dead.len() as u64, Ordering::Relaxed);
            for origin in &delivery.dead {
                self.observers.remove(origin);
            }
        }
        delivery
    }

    /// Drop observers whose receiver is gone, returning their origins.
    pub fn sweep_closed(&mut self) -> Vec<Origin> {
        let closed: Vec<Origin> = self
            .observers
            .iter()
            .filter(|(_, tx)| tx.is_closed())
            .map(|(origin, _)| *origin)
            .collect();
        for origin in &closed {
            self.observers.remove(origin);
        }
        closed
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_observers: self.observers.len(),
        }
    }
}
