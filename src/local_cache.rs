//! Bounded in-process cache tier
//!
//! Entries expire by TTL and are removed on read, by the periodic sweep, or
//! by capacity eviction. When a new key arrives at capacity, the oldest tenth
//! of the entries (by creation time) is dropped in one pass, which keeps
//! writes cheap under sustained pressure at the cost of strict LRU order.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::store::{CacheProvider, CacheStore, Cacheable};
use crate::sweeper::Sweeper;
use crate::CacheError;

/// A cached value with its lifetime bounds
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub data: Arc<V>,
    pub created_at: Instant,
    pub expires_at: Instant,
    /// Insertion order, breaks ties between equal `created_at`
    seq: u64,
}

impl<V> CacheEntry<V> {
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    next_seq: u64,
}

/// In-process TTL map with a hard size bound
pub struct LocalCache<V> {
    inner: Mutex<Inner<V>>,
    max_size: usize,
}

impl<V: Cacheable> LocalCache<V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_seq: 0,
            }),
            max_size: max_size.max(1),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of entries that will be evicted in one pass at capacity.
    pub fn eviction_batch(&self) -> usize {
        (self.max_size / 10).max(1)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(Arc::clone(&entry.data)),
            Some(_) => {}
            None => return None,
        }
        inner.entries.remove(key);
        debug!("Local cache entry expired on read: {}", key);
        None
    }

    /// Insert or overwrite `key`. A zero TTL stores nothing.
    pub fn set(&self, key: &str, value: Arc<V>, ttl: Duration) {
        if ttl.is_zero() {
            debug!("Refusing zero-TTL local cache entry: {}", key);
            self.delete(key);
            return;
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(key) && inner.entries.len() >= self.max_size {
            let evicted = Self::evict_oldest(&mut inner.entries, self.eviction_batch());
            debug!("Local cache at capacity, evicted {} entries", evicted);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key.to_owned(),
            CacheEntry {
                data: value,
                created_at: now,
                expires_at: now + ttl,
                seq,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Remove every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        before - inner.entries.len()
    }

    /// Start the periodic expiry sweep.
    ///
    /// The sweeper only holds a weak reference; it becomes a no-op once the
    /// cache is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, period: Duration) -> Sweeper {
        let cache: Weak<Self> = Arc::downgrade(self);
        Sweeper::spawn("local-cache-cleanup", period, move || {
            cache.upgrade().map_or(0, |cache| cache.purge_expired())
        })
    }

    fn evict_oldest(entries: &mut HashMap<String, CacheEntry<V>>, count: usize) -> usize {
        let mut by_age: Vec<(Instant, u64, String)> = entries
            .iter()
            .map(|(key, entry)| (entry.created_at, entry.seq, key.clone()))
            .collect();
        by_age.sort_unstable();

        let mut evicted = 0;
        for (_, _, key) in by_age.into_iter().take(count) {
            if entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        evicted
    }
}

#[async_trait]
impl<V: Cacheable> CacheStore<V> for LocalCache<V> {
    fn provider(&self) -> CacheProvider {
        CacheProvider::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<Arc<V>>, CacheError> {
        Ok(LocalCache::get(self, key))
    }

    async fn set(&self, key: &str, value: Arc<V>, ttl: Duration) -> Result<(), CacheError> {
        LocalCache::set(self, key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        LocalCache::delete(self, key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        LocalCache::clear(self);
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Arc<V>>>, CacheError> {
        Ok(keys.iter().map(|key| LocalCache::get(self, key)).collect())
    }

    async fn mset(&self, entries: &[(String, Arc<V>)], ttl: Duration) -> Result<(), CacheError> {
        for (key, value) in entries {
            LocalCache::set(self, key, Arc::clone(value), ttl);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<Duration, CacheError> {
        Ok(Duration::ZERO)
    }
}
