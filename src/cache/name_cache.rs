//! Client-side `(directory, name) -> inode` memoization
//!
//! Advisory only: a miss or a stale hit falls back to a server round trip.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use crate::cache::policy::CachePolicy;
use crate::metadata::{DirectoryId, InodeId, InodeType, ServerId};

/// What a successful lookup of `name` in a directory resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameCacheValue {
    pub inode: InodeId,
    pub inode_type: InodeType,
    /// Set for directories
    pub zeroth_server: Option<ServerId>,
}

/// Cache entry with timestamp for TTL support
#[derive(Clone)]
struct CacheEntry<T> {
    data: T,
    timestamp: Instant,
}

impl<T> CacheEntry<T> {
    fn new(data: T) -> Self {
        Self {
            data,
            timestamp: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.timestamp.elapsed() > ttl
    }
}

type NameKey = (DirectoryId, String);

/// Name cache keyed by `(directory, name)`
pub struct NameCache {
    cache: Mutex<LruCache<NameKey, CacheEntry<NameCacheValue>>>,
    policy: CachePolicy,
}

impl NameCache {
    /// Create a new name cache with the given policy
    pub fn new(policy: CachePolicy) -> Self {
        let capacity = NonZeroUsize::new(policy.max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);

        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            policy,
        }
    }

    /// Create a new name cache without TTL
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(CachePolicy::lru(capacity))
    }

    pub fn get(&self, dir: DirectoryId, name: &str) -> Option<NameCacheValue> {
        let key = (dir, name.to_string());
        let mut cache = self.cache.lock();

        let entry = cache.get(&key)?;
        if let Some(ttl) = self.policy.ttl {
            if entry.is_expired(ttl) {
                cache.pop(&key);
                tracing::trace!("Name cache entry expired: {}/{}", dir, name);
                return None;
            }
        }
        Some(entry.data)
    }

    pub fn put(&self, dir: DirectoryId, name: &str, value: NameCacheValue) {
        self.cache
            .lock()
            .put((dir, name.to_string()), CacheEntry::new(value));
    }

    pub fn invalidate(&self, dir: DirectoryId, name: &str) -> bool {
        self.cache.lock().pop(&(dir, name.to_string())).is_some()
    }

    /// Drop every name cached under `dir`
    pub fn invalidate_directory(&self, dir: DirectoryId) -> usize {
        let mut cache = self.cache.lock();
        let keys: Vec<NameKey> = cache
            .iter()
            .filter(|((d, _), _)| *d == dir)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            cache.pop(key);
        }
        keys.len()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
