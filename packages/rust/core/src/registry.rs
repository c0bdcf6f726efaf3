//! The live subscriber set.
//!
//! Mutations take the write lock; iteration copies the handles under the read
//! lock and releases it before running the callback, so callbacks may subscribe
//! or unsubscribe freely.

use std::collections::HashMap;

use feedcast_shared::SubscriberId;
use parking_lot::RwLock;
use tracing::debug;

use crate::subscriber::Subscriber;

/// Concurrency-safe bookkeeping of registered subscribers.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Returns `false` if it was already registered or is
    /// already closed.
    pub fn subscribe(&self, subscriber: Subscriber) -> bool {
        if subscriber.is_closed() {
            debug!(subscriber = %subscriber.id(), "ignoring closed subscriber");
            return false;
        }

        let mut subscribers = self.subscribers.write();
        if subscribers.contains_key(&subscriber.id()) {
            return false;
        }
        debug!(subscriber = %subscriber.id(), "subscribed");
        subscribers.insert(subscriber.id(), subscriber);
        true
    }

    /// Remove a subscriber and close it. Only the call that actually removes the
    /// entry closes it; unknown ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(&id);
        match removed {
            Some(subscriber) => {
                subscriber.close();
                debug!(subscriber = %id, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Remove and close every subscriber. Returns how many were removed.
    pub fn unsubscribe_all(&self) -> usize {
        let drained: Vec<Subscriber> = self.subscribers.write().drain().map(|(_, s)| s).collect();
        for subscriber in &drained {
            subscriber.close();
        }
        drained.len()
    }

    /// Point-in-time copy of the registered handles.
    pub fn snapshot(&self) -> Vec<Subscriber> {
        self.subscribers.read().values().cloned().collect()
    }

    /// Run `f` once per subscriber registered at the time of the call.
    pub fn for_each(&self, mut f: impl FnMut(&Subscriber)) {
        for subscriber in self.snapshot() {
            f(&subscriber);
        }
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.read().contains_key(&id)
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Whether no subscriber is registered.
    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}
