//! Cache policies

use std::time::Duration;

/// Cache policy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    /// Maximum number of entries in the cache
    pub max_entries: usize,

    /// Time-to-live for cache entries
    pub ttl: Option<Duration>,

    /// Number of independently locked shards
    pub shards: usize,
}

impl CachePolicy {
    /// Create a new cache policy with LRU eviction
    pub fn lru(max_entries: usize) -> Self {
        Self {
            max_entries,
            ttl: None,
            shards: 1,
        }
    }

    /// Create a new cache policy with LRU eviction and TTL
    pub fn lru_with_ttl(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries,
            ttl: Some(ttl),
            shards: 1,
        }
    }

    /// Split the cache into `shards` independently locked parts
    ///
    /// The shard count is rounded up to a power of two.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards.max(1).next_power_of_two();
        self
    }

    /// Capacity of a single shard (never zero)
    pub fn per_shard_capacity(&self) -> usize {
        let shards = self.shards.max(1);
        ((self.max_entries + shards - 1) / shards).max(1)
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::lru(1000)
    }
}
