//! Pending-read registrations keyed by cache key.

use std::collections::HashMap;
use std::hash::Hash;

use tokio::sync::oneshot::{channel, Receiver, Sender};

/// Maps a key to every single-fulfillment slot waiting on it, oldest first.
pub struct WaiterTable<K, V> {
    slots: HashMap<K, Vec<Sender<V>>>,
}

impl<K: Hash + Eq, V: Clone> WaiterTable<K, V> {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Add a slot for `key`. Slots whose receivers were dropped are discarded
    /// first so abandoned waits do not accumulate.
    pub fn register(&mut self, key: K) -> Receiver<V> {
        let (sender, receiver) = channel();
        let listeners = self.slots.entry(key).or_default();
        listeners.retain(|s| !s.is_closed());
        listeners.push(sender);
        receiver
    }

    /// Deliver `value` to every slot for `key` and drop the registration.
    /// Returns how many live waiters received it.
    pub fn fulfill(&mut self, key: &K, value: &V) -> usize {
        let Some(listeners) = self.slots.remove(key) else {
            return 0;
        };
        listeners
            .into_iter()
            .filter(|listener| !listener.is_closed())
            .map(|listener| listener.send(value.clone()))
            .filter(|sent| sent.is_ok())
            .count()
    }

    /// Drop closed slots for `key`, removing the key once none remain.
    pub fn prune_key(&mut self, key: &K) {
        if let Some(listeners) = self.slots.get_mut(key) {
            listeners.retain(|s| !s.is_closed());
            if listeners.is_empty() {
                self.slots.remove(key);
            }
        }
    }

    /// Number of live waiters for `key`.
    pub fn pending(&self, key: &K) -> usize {
        self.slots
            .get(key)
            .map_or(0, |listeners| listeners.iter().filter(|s| !s.is_closed()).count())
    }

    /// Number of keys with at least one registration.
    pub fn keys(&self) -> usize {
        self.slots.len()
    }
}

impl<K: Hash + Eq, V: Clone> Default for WaiterTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
