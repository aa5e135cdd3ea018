//! Sharded, pin-counted LRU of per-directory partition maps
//!
//! The cache is the only in-memory owner of a directory's `PartitionMap` on a
//! server. Every reader or writer holds a [`DirPin`] for as long as it uses
//! the entry. A pin is an `Arc` clone, so the table's copy plus live pins is
//! the reference count, and an entry with outstanding pins is never evicted.
//! When every entry in a shard is pinned the shard grows past its capacity
//! until pins are released.

use lru::LruCache;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::instrument;
use xxhash_rust::xxh64::xxh64;

use crate::cache::policy::CachePolicy;
use crate::metadata::{
    DirectoryId, PartitionIndex, PartitionMap, PartitionMapResult, MAX_PARTITIONS,
};

/// A split currently running against a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitInProgress {
    pub parent: PartitionIndex,
    pub child: PartitionIndex,
}

/// One cached directory
pub struct CacheEntry {
    handle: DirectoryId,
    mapping: RwLock<PartitionMap>,
    /// Approximate live-entry count per partition. Split trigger only.
    partition_size: Box<[AtomicU64]>,
    split_in_progress: Mutex<Option<SplitInProgress>>,
    /// Held shared by mutating requests, exclusively while claiming the split slot
    mutation_gate: RwLock<()>,
}

impl CacheEntry {
    pub fn new(handle: DirectoryId, mapping: PartitionMap) -> Self {
        let partition_size = (0..MAX_PARTITIONS).map(|_| AtomicU64::new(0)).collect();
        Self {
            handle,
            mapping: RwLock::new(mapping),
            partition_size,
            split_in_progress: Mutex::new(None),
            mutation_gate: RwLock::new(()),
        }
    }

    pub fn handle(&self) -> DirectoryId {
        self.handle
    }

    /// Copy of the current map
    pub fn mapping(&self) -> PartitionMap {
        *self.mapping.read()
    }

    /// Merge a map learned from a peer into this entry
    ///
    /// # Returns
    /// `true` if the local map changed
    pub fn merge_mapping(&self, other: &PartitionMap) -> PartitionMapResult<bool> {
        self.mapping.write().merge(other)
    }

    /// Record a finished split. Only reachable while holding the split slot.
    pub fn publish_split(&self, slot: &SplitSlot) -> PartitionMapResult<PartitionMap> {
        let mut mapping = self.mapping.write();
        mapping.mark_split(slot.split.child)?;
        Ok(*mapping)
    }

    pub fn partition_size(&self, index: PartitionIndex) -> u64 {
        self.partition_size
            .get(index as usize)
            .map(|s| s.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn set_partition_size(&self, index: PartitionIndex, size: u64) {
        if let Some(s) = self.partition_size.get(index as usize) {
            s.store(size, Ordering::Relaxed);
        }
    }

    /// Bump a partition's size and return the new value
    pub fn increment_partition_size(&self, index: PartitionIndex) -> u64 {
        self.partition_size
            .get(index as usize)
            .map(|s| s.fetch_add(1, Ordering::Relaxed) + 1)
            .unwrap_or(0)
    }

    /// Lower a partition's size, saturating at zero
    pub fn decrement_partition_size(&self, index: PartitionIndex, by: u64) {
        if let Some(s) = self.partition_size.get(index as usize) {
            let _ = s.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(by))
            });
        }
    }

    pub fn split_in_progress(&self) -> Option<SplitInProgress> {
        *self.split_in_progress.lock()
    }

    /// Hold off split slot claims while a mutation checks and applies itself
    pub fn mutation_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.mutation_gate.read()
    }

    /// Claim the directory's single split slot
    ///
    /// Returns `None` if another split of this directory is running. The
    /// slot is released when the returned guard is dropped. Waits for
    /// in-flight mutations so none of them can land behind the extraction.
    pub fn try_begin_split(
        self: &Arc<Self>,
        parent: PartitionIndex,
        child: PartitionIndex,
    ) -> Option<SplitSlot> {
        let _gate = self.mutation_gate.write();
        let mut slot = self.split_in_progress.lock();
        if slot.is_some() {
            return None;
        }
        let split = SplitInProgress { parent, child };
        *slot = Some(split);
        Some(SplitSlot {
            entry: Arc::clone(self),
            split,
        })
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("handle", &self.handle)
            .field("mapping", &self.mapping())
            .field("split_in_progress", &self.split_in_progress())
            .finish()
    }
}

/// Exclusive right to split one directory
pub struct SplitSlot {
    entry: Arc<CacheEntry>,
    split: SplitInProgress,
}

impl SplitSlot {
    pub fn parent(&self) -> PartitionIndex {
        self.split.parent
    }

    pub fn child(&self) -> PartitionIndex {
        self.split.child
    }
}

impl Drop for SplitSlot {
    fn drop(&mut self) {
        *self.entry.split_in_progress.lock() = None;
    }
}

/// A caller's hold on a cache entry
#[derive(Clone)]
pub struct DirPin {
    entry: Arc<CacheEntry>,
}

impl DirPin {
    /// Table reference plus every live pin (and split slot)
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.entry)
    }

    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }
}

impl Deref for DirPin {
    type Target = CacheEntry;

    fn deref(&self) -> &CacheEntry {
        &self.entry
    }
}

impl std::fmt::Debug for DirPin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DirPin").field(&self.entry.handle).finish()
    }
}

type Shard = Mutex<LruCache<DirectoryId, Arc<CacheEntry>>>;

/// Sharded directory cache
pub struct DirectoryCache {
    shards: Box<[Shard]>,
    shard_bits: u32,
    per_shard_capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl DirectoryCache {
    pub fn new(policy: &CachePolicy) -> Self {
        let shard_count = policy.shards.max(1).next_power_of_two();
        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::unbounded()))
            .collect();

        Self {
            shards,
            shard_bits: shard_count.trailing_zeros(),
            per_shard_capacity: ((policy.max_entries + shard_count - 1) / shard_count).max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn with_capacity(capacity: usize, shards: usize) -> Self {
        Self::new(&CachePolicy::lru(capacity).with_shards(shards))
    }

    // 連番IDが同じシャードに偏らないよう、ハッシュの上位ビットで選ぶ
    fn shard_for(&self, id: DirectoryId) -> &Shard {
        let index = if self.shard_bits == 0 {
            0
        } else {
            (xxh64(&id.to_le_bytes(), 0) >> (64 - self.shard_bits)) as usize
        };
        &self.shards[index]
    }

    /// Pin the entry for `id`, marking it most recently used
    pub fn lookup(&self, id: DirectoryId) -> Option<DirPin> {
        let mut shard = self.shard_for(id).lock();
        match shard.get(&id) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(DirPin {
                    entry: Arc::clone(entry),
                })
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Add or replace the entry for `id` and return the caller's pin
    ///
    /// The new entry starts with a reference count of 2 (table and caller).
    /// Pins on a replaced entry stay valid but are detached from the table.
    #[instrument(level = "trace", skip(self, entry), fields(dir = id))]
    pub fn insert(&self, id: DirectoryId, entry: CacheEntry) -> DirPin {
        let entry = Arc::new(entry);
        let mut shard = self.shard_for(id).lock();
        shard.put(id, Arc::clone(&entry));
        self.evict_unpinned(&mut shard);
        DirPin { entry }
    }

    /// Insert unless another thread got there first
    ///
    /// On a race the existing entry wins and absorbs the new entry's map, so
    /// two concurrent loads of the same directory share one entry.
    pub fn insert_or_merge(&self, id: DirectoryId, entry: CacheEntry) -> DirPin {
        let mut shard = self.shard_for(id).lock();
        if let Some(existing) = shard.get(&id) {
            let existing = Arc::clone(existing);
            drop(shard);
            if let Err(e) = existing.merge_mapping(&entry.mapping()) {
                tracing::warn!("Dropping conflicting map for directory {}: {}", id, e);
            }
            return DirPin { entry: existing };
        }

        let entry = Arc::new(entry);
        shard.put(id, Arc::clone(&entry));
        self.evict_unpinned(&mut shard);
        DirPin { entry }
    }

    /// Give up a pin. The entry becomes evictable once no pins remain.
    pub fn release(&self, pin: DirPin) {
        drop(pin);
    }

    /// Remove `id` if nothing holds a pin on it
    ///
    /// # Returns
    /// `true` if the entry was removed or was not cached
    pub fn erase(&self, id: DirectoryId) -> bool {
        let mut shard = self.shard_for(id).lock();
        match shard.peek(&id) {
            None => true,
            Some(entry) if Arc::strong_count(entry) == 1 => {
                shard.pop(&id);
                tracing::debug!("Erased directory {} from cache", id);
                true
            }
            Some(_) => false,
        }
    }

    fn evict_unpinned(&self, shard: &mut LruCache<DirectoryId, Arc<CacheEntry>>) {
        while shard.len() > self.per_shard_capacity {
            // 最も古い未ピンのエントリを探す
            let victim = shard
                .iter()
                .rev()
                .find(|(_, entry)| Arc::strong_count(entry) == 1)
                .map(|(id, _)| *id);

            match victim {
                Some(id) => {
                    shard.pop(&id);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!("Evicted directory {} from cache", id);
                }
                None => {
                    tracing::debug!(
                        "Cache shard over capacity with all entries pinned ({} > {})",
                        shard.len(),
                        self.per_shard_capacity
                    );
                    break;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: DirectoryId) -> bool {
        self.shard_for(id).lock().contains(&id)
    }

    pub fn capacity(&self) -> usize {
        self.per_shard_capacity * self.shards.len()
    }

    pub fn stats(&self) -> DirectoryCacheStats {
        let mut entries = 0;
        let mut pinned = 0;
        for shard in self.shards.iter() {
            let shard = shard.lock();
            entries += shard.len();
            pinned += shard
                .iter()
                .filter(|(_, e)| Arc::strong_count(e) > 1)
                .count();
        }

        DirectoryCacheStats {
            entries,
            pinned,
            capacity: self.capacity(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Directory cache statistics
#[derive(Debug, Clone, Copy)]
pub struct DirectoryCacheStats {
    pub entries: usize,
    pub pinned: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl DirectoryCacheStats {
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.entries as f64 / self.capacity as f64
        }
    }
}
