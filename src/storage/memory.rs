use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::instrument;

use super::{
    MetadataStore, ScanSummary, SequenceRange, StorageError, StorageResult, TransportRecord,
    TransportUnit,
};
use crate::metadata::partition_map::parent_of;
use crate::metadata::{belongs_to_child, DirectoryId, EntryRecord, PartitionIndex, PartitionMap};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    sequence: u64,
    entry: EntryRecord,
}

type PartitionKey = (DirectoryId, PartitionIndex);

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    partitions: HashMap<PartitionKey, BTreeMap<String, StoredEntry>>,
    mappings: HashMap<DirectoryId, PartitionMap>,
}

/// インメモリメタデータストア
///
/// 書き込みごとに単調増加のシーケンス番号を付与する。
/// `save_snapshot` / `load_snapshot` でファイルに退避できる。
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    next_sequence: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_sequence: AtomicU64::new(1),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn stored(&self, entry: EntryRecord) -> StoredEntry {
        StoredEntry {
            sequence: self.next_sequence(),
            entry,
        }
    }

    /// 全パーティションの総エントリ数
    pub fn total_entries(&self) -> u64 {
        self.tables
            .read()
            .partitions
            .values()
            .map(|p| p.len() as u64)
            .sum()
    }

    /// スナップショットをファイルに書き出す
    pub fn save_snapshot(&self, path: &Path) -> StorageResult<()> {
        let bytes = {
            let tables = self.tables.read();
            bincode::serialize(&*tables)?
        };
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        tracing::info!("Saved metadata snapshot to {}", path.display());
        Ok(())
    }

    /// スナップショットから復元する
    pub fn load_snapshot(path: &Path) -> StorageResult<Self> {
        let bytes = std::fs::read(path)?;
        let tables: Tables = bincode::deserialize(&bytes)?;

        let max_sequence = tables
            .partitions
            .values()
            .flat_map(|p| p.values())
            .map(|e| e.sequence)
            .max()
            .unwrap_or(0);

        tracing::info!(
            "Loaded metadata snapshot from {} ({} partitions, {} maps)",
            path.display(),
            tables.partitions.len(),
            tables.mappings.len()
        );

        Ok(Self {
            tables: RwLock::new(tables),
            next_sequence: AtomicU64::new(max_sequence + 1),
        })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(dir: DirectoryId, partition: PartitionIndex, name: &str) -> StorageError {
    StorageError::NotFound(format!("{}/{}/{}", dir, partition, name))
}

fn check_child(parent: PartitionIndex, child: PartitionIndex) -> StorageResult<()> {
    if child == parent || parent_of(child) != parent {
        return Err(StorageError::NotAChild { parent, child });
    }
    Ok(())
}

impl MetadataStore for InMemoryStore {
    fn get(
        &self,
        dir: DirectoryId,
        partition: PartitionIndex,
        name: &str,
    ) -> StorageResult<EntryRecord> {
        self.tables
            .read()
            .partitions
            .get(&(dir, partition))
            .and_then(|p| p.get(name))
            .map(|s| s.entry.clone())
            .ok_or_else(|| not_found(dir, partition, name))
    }

    fn put(
        &self,
        dir: DirectoryId,
        partition: PartitionIndex,
        name: &str,
        entry: EntryRecord,
    ) -> StorageResult<()> {
        let stored = self.stored(entry);
        self.tables
            .write()
            .partitions
            .entry((dir, partition))
            .or_default()
            .insert(name.to_string(), stored);
        Ok(())
    }

    fn insert_new(
        &self,
        dir: DirectoryId,
        partition: PartitionIndex,
        name: &str,
        entry: EntryRecord,
    ) -> StorageResult<()> {
        let mut tables = self.tables.write();
        let table = tables.partitions.entry((dir, partition)).or_default();
        if table.contains_key(name) {
            return Err(StorageError::AlreadyExists(format!(
                "{}/{}/{}",
                dir, partition, name
            )));
        }
        let stored = self.stored(entry);
        table.insert(name.to_string(), stored);
        Ok(())
    }

    fn update(
        &self,
        dir: DirectoryId,
        partition: PartitionIndex,
        name: &str,
        f: &mut dyn FnMut(&mut EntryRecord),
    ) -> StorageResult<EntryRecord> {
        let mut tables = self.tables.write();
        let stored = tables
            .partitions
            .get_mut(&(dir, partition))
            .and_then(|p| p.get_mut(name))
            .ok_or_else(|| not_found(dir, partition, name))?;

        f(&mut stored.entry);
        stored.sequence = self.next_sequence();
        Ok(stored.entry.clone())
    }

    fn delete(
        &self,
        dir: DirectoryId,
        partition: PartitionIndex,
        name: &str,
    ) -> StorageResult<EntryRecord> {
        let mut tables = self.tables.write();
        let table = tables
            .partitions
            .get_mut(&(dir, partition))
            .ok_or_else(|| not_found(dir, partition, name))?;
        let removed = table
            .remove(name)
            .ok_or_else(|| not_found(dir, partition, name))?;
        if table.is_empty() {
            tables.partitions.remove(&(dir, partition));
        }
        Ok(removed.entry)
    }

    fn list_partition(
        &self,
        dir: DirectoryId,
        partition: PartitionIndex,
    ) -> StorageResult<Vec<(String, EntryRecord)>> {
        Ok(self
            .tables
            .read()
            .partitions
            .get(&(dir, partition))
            .map(|p| {
                p.iter()
                    .map(|(name, s)| (name.clone(), s.entry.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn partition_len(&self, dir: DirectoryId, partition: PartitionIndex) -> StorageResult<u64> {
        Ok(self
            .tables
            .read()
            .partitions
            .get(&(dir, partition))
            .map(|p| p.len() as u64)
            .unwrap_or(0))
    }

    #[instrument(level = "trace", skip(self))]
    fn scan_partition(
        &self,
        dir: DirectoryId,
        parent: PartitionIndex,
        child: PartitionIndex,
    ) -> StorageResult<ScanSummary> {
        check_child(parent, child)?;

        let mut range = SequenceRange::empty();
        let records: Vec<TransportRecord> = {
            let tables = self.tables.read();
            tables
                .partitions
                .get(&(dir, parent))
                .map(|p| {
                    p.iter()
                        .filter(|(name, _)| belongs_to_child(name, child))
                        .map(|(name, s)| TransportRecord {
                            name: name.clone(),
                            sequence: s.sequence,
                            entry: s.entry.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        for record in &records {
            range = range.extend(record.sequence);
        }

        let unit = TransportUnit::encode(dir, child, &records)?;
        tracing::debug!(
            "Scanned {} entries of {}/{} for child {} ({} bytes)",
            records.len(),
            dir,
            parent,
            child,
            unit.payload_len()
        );

        Ok(ScanSummary {
            unit,
            count: records.len() as u64,
            range,
        })
    }

    #[instrument(level = "trace", skip(self, unit), fields(dir = unit.directory, partition = unit.partition))]
    fn bulk_load(&self, unit: &TransportUnit, range: SequenceRange) -> StorageResult<u64> {
        let records = unit.decode()?;

        if let Some(bad) = records.iter().find(|r| !range.contains(r.sequence)) {
            tracing::error!(
                "Record {} (sequence {}) outside {:?}",
                bad.name,
                bad.sequence,
                range
            );
            return Err(StorageError::SequenceOutOfRange {
                directory: unit.directory,
                partition: unit.partition,
                start: range.start,
                end: range.end,
            });
        }

        let count = records.len() as u64;
        let table: BTreeMap<String, StoredEntry> = records
            .into_iter()
            .map(|r| {
                let stored = self.stored(r.entry);
                (r.name, stored)
            })
            .collect();

        let mut tables = self.tables.write();
        if table.is_empty() {
            tables.partitions.remove(&(unit.directory, unit.partition));
        } else {
            tables
                .partitions
                .insert((unit.directory, unit.partition), table);
        }
        Ok(count)
    }

    fn remove_partition_range(
        &self,
        dir: DirectoryId,
        parent: PartitionIndex,
        child: PartitionIndex,
    ) -> StorageResult<u64> {
        check_child(parent, child)?;

        let mut tables = self.tables.write();
        let Some(table) = tables.partitions.get_mut(&(dir, parent)) else {
            return Ok(0);
        };
        let before = table.len();
        table.retain(|name, _| !belongs_to_child(name, child));
        Ok((before - table.len()) as u64)
    }

    fn drop_partition(&self, dir: DirectoryId, partition: PartitionIndex) -> StorageResult<u64> {
        Ok(self
            .tables
            .write()
            .partitions
            .remove(&(dir, partition))
            .map(|p| p.len() as u64)
            .unwrap_or(0))
    }

    fn put_mapping(&self, dir: DirectoryId, mapping: &PartitionMap) -> StorageResult<()> {
        self.tables.write().mappings.insert(dir, *mapping);
        Ok(())
    }

    fn get_mapping(&self, dir: DirectoryId) -> StorageResult<Option<PartitionMap>> {
        Ok(self.tables.read().mappings.get(&dir).copied())
    }

    fn delete_mapping(&self, dir: DirectoryId) -> StorageResult<()> {
        self.tables.write().mappings.remove(&dir);
        Ok(())
    }
}
