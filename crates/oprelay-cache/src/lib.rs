//! Bounded confirmation cache with a "wait until produced" read.
//!
//! Readers call [`ConfirmationCache::get`] with an operation hash and are
//! suspended until the chain poller writes the matching confirmation with
//! [`ConfirmationCache::set`]. Entries are evicted least-recently-used once
//! the configured capacity is reached.
//!
//! Both "check present, else register waiter" and "fulfill waiters, write,
//! evict" run under a single lock, so a confirmation can never slip between a
//! reader's presence check and its registration.

use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use oprelay_types::{OpHash, TxHash};
use tokio::sync::oneshot::Receiver;
use tracing::{debug, trace};

pub mod waiters;

use waiters::WaiterTable;

/// Capacity used by the relay when none is configured.
pub const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(n) => n,
    None => unreachable!(),
};

/// The cache the relay shares between the poller and request handlers.
pub type OpConfirmationCache = ConfirmationCache<OpHash, TxHash>;

/// Counters for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered from a cached entry.
    pub hits: u64,
    /// Reads that had to register a waiter.
    pub waits: u64,
    /// Waiters resolved by a `set`.
    pub fulfilled: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    waits: AtomicU64,
    fulfilled: AtomicU64,
    evictions: AtomicU64,
}

struct Inner<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    waiters: WaiterTable<K, V>,
}

enum Lookup<V> {
    Ready(V),
    Pending(Receiver<V>),
}

/// Bounded key/value store whose reads can wait for a value to be written.
pub struct ConfirmationCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    stats: AtomicStats,
}

impl<K, V> ConfirmationCache<K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                waiters: WaiterTable::new(),
            }),
            stats: AtomicStats::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup_or_register(&self, key: &K) -> Lookup<V> {
        let mut inner = self.lock();
        if let Some(value) = inner.entries.get(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            trace!(?key, "cache hit, entry promoted");
            return Lookup::Ready(value.clone());
        }
        self.stats.waits.fetch_add(1, Ordering::Relaxed);
        trace!(?key, "cache miss, waiter registered");
        Lookup::Pending(inner.waiters.register(key.clone()))
    }

    /// Return the value for `key`, waiting for a matching [`set`](Self::set)
    /// if it is not cached yet. A hit promotes the entry to most recently used.
    ///
    /// There is no internal deadline; use [`get_timeout`](Self::get_timeout)
    /// or race this future against one.
    pub async fn get(&self, key: &K) -> V {
        loop {
            match self.lookup_or_register(key) {
                Lookup::Ready(value) => return value,
                Lookup::Pending(receiver) => {
                    let mut wait = PendingWait { cache: self, key, receiver: Some(receiver) };
                    if let Some(value) = wait.recv().await {
                        return value;
                    }
                }
            }
        }
    }

    /// Like [`get`](Self::get) but gives up after `timeout`. A `set` that
    /// arrives later still caches its value for the next reader.
    pub async fn get_timeout(&self, key: &K, timeout: Duration) -> Option<V> {
        let result = tokio::time::timeout(timeout, self.get(key)).await;
        match result {
            Ok(value) => Some(value),
            Err(_) => {
                debug!(?key, ?timeout, "wait for cache entry timed out");
                None
            }
        }
    }

    /// Non-blocking read; promotes the entry on a hit.
    pub fn try_get(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        let value = inner.entries.get(key).cloned();
        if value.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Read without touching recency order.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.lock().entries.peek(key).cloned()
    }

    /// Insert or overwrite `key` as most recently used.
    ///
    /// Every waiter registered for `key` receives `value` before any eviction
    /// happens. Returns the key evicted to make room, if any.
    pub fn set(&self, key: K, value: V) -> Option<K> {
        let mut inner = self.lock();

        let fulfilled = inner.waiters.fulfill(&key, &value);
        if fulfilled > 0 {
            self.stats.fulfilled.fetch_add(fulfilled as u64, Ordering::Relaxed);
            debug!(?key, fulfilled, "waiters fulfilled");
        }

        match inner.entries.push(key.clone(), value) {
            Some((evicted, _)) if evicted != key => {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(?evicted, "evicted least recently used entry");
                Some(evicted)
            }
            _ => None,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().entries.cap().get()
    }

    /// Number of callers currently suspended on `key`.
    pub fn pending_waiters(&self, key: &K) -> usize {
        self.lock().waiters.pending(key)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            waits: self.stats.waits.load(Ordering::Relaxed),
            fulfilled: self.stats.fulfilled.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }
}

/// A registered read. Dropping it before the value arrives removes its
/// slot, so reads abandoned by a caller's deadline leave nothing behind.
struct PendingWait<'a, K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    cache: &'a ConfirmationCache<K, V>,
    key: &'a K,
    receiver: Option<Receiver<V>>,
}

impl<K, V> PendingWait<'_, K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    async fn recv(&mut self) -> Option<V> {
        let receiver = self.receiver.as_mut()?;
        let value = receiver.await.ok();
        self.receiver = None;
        value
    }
}

impl<K, V> Drop for PendingWait<'_, K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            drop(receiver);
            self.cache.lock().waiters.prune_key(self.key);
            trace!(key = ?self.key, "abandoned waiter removed");
        }
    }
}

impl<K, V> Default for ConfirmationCache<K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
