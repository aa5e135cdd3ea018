//! Store wrapper that fails chosen operations on demand

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::{
    InMemoryStore, MetadataStore, ScanSummary, SequenceRange, StorageError, StorageResult,
    TransportUnit,
};
use crate::metadata::{DirectoryId, EntryRecord, PartitionIndex, PartitionMap};

fn injected(op: &str) -> StorageError {
    StorageError::Internal(format!("injected {} failure", op))
}

#[derive(Default)]
pub(crate) struct FaultyStore {
    inner: InMemoryStore,
    remove_range_failures: AtomicU32,
    fail_put_mapping: AtomicBool,
    fail_delete_mapping: AtomicBool,
}

impl FaultyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    /// 次の `n` 回の `remove_partition_range` を失敗させる
    pub(crate) fn fail_remove_range(&self, n: u32) {
        self.remove_range_failures.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_put_mapping(&self, fail: bool) {
        self.fail_put_mapping.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_delete_mapping(&self, fail: bool) {
        self.fail_delete_mapping.store(fail, Ordering::SeqCst);
    }
}

impl MetadataStore for FaultyStore {
    fn get(&self, dir: DirectoryId, partition: PartitionIndex, name: &str) -> StorageResult<EntryRecord> {
        self.inner.get(dir, partition, name)
    }

    fn put(
        &self,
        dir: DirectoryId,
        partition: PartitionIndex,
        name: &str,
        entry: EntryRecord,
    ) -> StorageResult<()> {
        self.inner.put(dir, partition, name, entry)
    }

    fn insert_new(
        &self,
        dir: DirectoryId,
        partition: PartitionIndex,
        name: &str,
        entry: EntryRecord,
    ) -> StorageResult<()> {
        self.inner.insert_new(dir, partition, name, entry)
    }

    fn update(
        &self,
        dir: DirectoryId,
        partition: PartitionIndex,
        name: &str,
        f: &mut dyn FnMut(&mut EntryRecord),
    ) -> StorageResult<EntryRecord> {
        self.inner.update(dir, partition, name, f)
    }

    fn delete(&self, dir: DirectoryId, partition: PartitionIndex, name: &str) -> StorageResult<EntryRecord> {
        self.inner.delete(dir, partition, name)
    }

    fn list_partition(
        &self,
        dir: DirectoryId,
        partition: PartitionIndex,
    ) -> StorageResult<Vec<(String, EntryRecord)>> {
        self.inner.list_partition(dir, partition)
    }

    fn partition_len(&self, dir: DirectoryId, partition: PartitionIndex) -> StorageResult<u64> {
        self.inner.partition_len(dir, partition)
    }

    fn scan_partition(
        &self,
        dir: DirectoryId,
        parent: PartitionIndex,
        child: PartitionIndex,
    ) -> StorageResult<ScanSummary> {
        self.inner.scan_partition(dir, parent, child)
    }

    fn bulk_load(&self, unit: &TransportUnit, range: SequenceRange) -> StorageResult<u64> {
        self.inner.bulk_load(unit, range)
    }

    fn remove_partition_range(
        &self,
        dir: DirectoryId,
        parent: PartitionIndex,
        child: PartitionIndex,
    ) -> StorageResult<u64> {
        let failing = self
            .remove_range_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(injected("remove_partition_range"));
        }
        self.inner.remove_partition_range(dir, parent, child)
    }

    fn drop_partition(&self, dir: DirectoryId, partition: PartitionIndex) -> StorageResult<u64> {
        self.inner.drop_partition(dir, partition)
    }

    fn put_mapping(&self, dir: DirectoryId, mapping: &PartitionMap) -> StorageResult<()> {
        if self.fail_put_mapping.load(Ordering::SeqCst) {
            return Err(injected("put_mapping"));
        }
        self.inner.put_mapping(dir, mapping)
    }

    fn get_mapping(&self, dir: DirectoryId) -> StorageResult<Option<PartitionMap>> {
        self.inner.get_mapping(dir)
    }

    fn delete_mapping(&self, dir: DirectoryId) -> StorageResult<()> {
        if self.fail_delete_mapping.load(Ordering::SeqCst) {
            return Err(injected("delete_mapping"));
        }
        self.inner.delete_mapping(dir)
    }
}
