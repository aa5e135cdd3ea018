use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use super::queue::SplitTask;
use crate::cache::{DirPin, DirectoryCache, SplitSlot};
use crate::metadata::{DirectoryId, PartitionIndex, PartitionMap, PartitionMapError, ServerId};
use crate::rpc::protocol::{Reply, Request, Status};
use crate::rpc::{RpcError, Transport};
use crate::storage::{MetadataStore, ScanSummary, StorageError};

/// 分割エラー
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Partition map error: {0}")]
    Mapping(#[from] PartitionMapError),

    #[error("Placement of partition {child} on server {target} failed: {source}")]
    Placement {
        child: PartitionIndex,
        target: ServerId,
        source: RpcError,
    },

    #[error("Server {target} rejected partition {child}: {status:?}")]
    Rejected {
        child: PartitionIndex,
        target: ServerId,
        status: Status,
    },

    #[error("Placed {actual} entries, expected {expected}")]
    CountMismatch { expected: u64, actual: u64 },

    #[error("Split cancelled")]
    Cancelled,
}

pub type SplitResult<T> = Result<T, SplitError>;

/// 分割を行わなかった理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// ディレクトリがキャッシュにない
    NotCached,
    /// 親パーティションがこのサーバーのものではない
    NotOwner,
    /// サイズが閾値未満
    BelowThreshold,
    /// 同じディレクトリの別の分割が実行中
    SplitInProgress,
    /// これ以上分割できない
    MaxRadix,
}

/// 分割結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    Published {
        parent: PartitionIndex,
        child: PartitionIndex,
        target: ServerId,
        moved: u64,
        mapping: PartitionMap,
        /// 親からの削除に失敗し、再試行待ち
        cleanup_pending: bool,
    },
    Skipped(SkipReason),
}

/// 公開済みだが親パーティションにまだ残っている移動分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingCleanup {
    dir: DirectoryId,
    parent: PartitionIndex,
    child: PartitionIndex,
}

/// 分割コーディネータ
///
/// 1つの分割は Select → Extract → Place → Publish → Commit → Release の順に進む。
/// Place で子を受け取ったサーバーは Commit まで古いマップのまま動くので、
/// Publish より前の失敗では Abort で保留分を捨てるだけでやり直せる。
pub struct SplitCoordinator {
    server_id: ServerId,
    cache: Arc<DirectoryCache>,
    store: Arc<dyn MetadataStore>,
    transport: Arc<dyn Transport>,
    threshold: u64,
    place_timeout: Duration,
    cancelled: Arc<AtomicBool>,
    pending_cleanups: Mutex<Vec<PendingCleanup>>,
}

impl SplitCoordinator {
    pub fn new(
        server_id: ServerId,
        cache: Arc<DirectoryCache>,
        store: Arc<dyn MetadataStore>,
        transport: Arc<dyn Transport>,
        threshold: u64,
        place_timeout: Duration,
    ) -> Self {
        Self {
            server_id,
            cache,
            store,
            transport,
            threshold,
            place_timeout,
            cancelled: Arc::new(AtomicBool::new(false)),
            pending_cleanups: Mutex::new(Vec::new()),
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// 実行中の分割を次の段階の境界で中断させる
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SplitResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SplitError::Cancelled);
        }
        Ok(())
    }

    /// キューから取り出したタスクを実行する
    #[instrument(level = "debug", skip(self), fields(server = self.server_id))]
    pub fn run_task(&self, task: SplitTask) -> SplitResult<SplitOutcome> {
        let Some(pin) = self.cache.lookup(task.directory) else {
            tracing::debug!("Directory {} no longer cached, dropping split", task.directory);
            return Ok(SplitOutcome::Skipped(SkipReason::NotCached));
        };
        let result = self.split(&pin, task.parent);
        self.cache.release(pin);
        result
    }

    /// ピン済みディレクトリのパーティション `parent` を分割する
    pub fn split(&self, pin: &DirPin, parent: PartitionIndex) -> SplitResult<SplitOutcome> {
        let dir = pin.handle();

        // Select
        let mapping = pin.mapping();
        if !mapping.exists(parent) || mapping.server_for_index(parent) != self.server_id {
            return Ok(SplitOutcome::Skipped(SkipReason::NotOwner));
        }

        let size = self.store.partition_len(dir, parent)?;
        pin.set_partition_size(parent, size);
        if size < self.threshold {
            return Ok(SplitOutcome::Skipped(SkipReason::BelowThreshold));
        }

        let child = match mapping.compute_child_index(parent) {
            Ok(child) => child,
            Err(PartitionMapError::MaxRadixReached { .. }) => {
                tracing::debug!("Partition {}/{} is at max radix", dir, parent);
                return Ok(SplitOutcome::Skipped(SkipReason::MaxRadix));
            }
            Err(e) => return Err(e.into()),
        };

        let Some(slot) = pin.entry().try_begin_split(parent, child) else {
            return Ok(SplitOutcome::Skipped(SkipReason::SplitInProgress));
        };

        // スロット取得前に別の分割が公開されていないか確認
        if pin.mapping().compute_child_index(parent)? != child {
            return Ok(SplitOutcome::Skipped(SkipReason::SplitInProgress));
        }

        tracing::info!(
            "Splitting directory {} partition {} -> {} ({} entries)",
            dir,
            parent,
            child,
            size
        );

        // Extract
        self.check_cancelled()?;
        let summary = self.store.scan_partition(dir, parent, child)?;

        let mut post_split = pin.mapping();
        post_split.mark_split(child)?;
        let target = post_split.server_for_index(child);

        // Place
        self.check_cancelled()?;
        if let Err(e) = self.place(dir, parent, child, target, &summary, &post_split) {
            tracing::warn!(
                "Aborting split of {}/{} -> {}: {}",
                dir,
                parent,
                child,
                e
            );
            self.abort_placement(dir, child, target);
            return Err(e);
        }

        // Publish
        let published = match self.publish(pin, &slot, child) {
            Ok(mapping) => mapping,
            Err(e) => {
                tracing::warn!(
                    "Aborting split of {}/{} -> {} before publish: {}",
                    dir,
                    parent,
                    child,
                    e
                );
                self.abort_placement(dir, child, target);
                return Err(e);
            }
        };

        // Commit
        if target != self.server_id {
            self.commit_placement(dir, parent, child, target, &published);
        }

        let cleanup_pending = match self.store.remove_partition_range(dir, parent, child) {
            Ok(removed) => {
                if removed != summary.count {
                    tracing::warn!(
                        "Removed {} entries from {}/{} but moved {}",
                        removed,
                        dir,
                        parent,
                        summary.count
                    );
                }
                pin.decrement_partition_size(parent, removed);
                false
            }
            Err(e) => {
                tracing::error!(
                    "Split of {}/{} published but parent cleanup failed, will retry: {}",
                    dir,
                    parent,
                    e
                );
                self.pending_cleanups
                    .lock()
                    .push(PendingCleanup { dir, parent, child });
                true
            }
        };
        if target == self.server_id {
            pin.set_partition_size(child, summary.count);
        }

        tracing::info!(
            "Published split {}/{} -> {} on server {} (moved {}, radix {})",
            dir,
            parent,
            child,
            target,
            summary.count,
            published.radix()
        );

        // Release
        drop(slot);

        Ok(SplitOutcome::Published {
            parent,
            child,
            target,
            moved: summary.count,
            mapping: published,
            cleanup_pending,
        })
    }

    /// 永続化してからキャッシュのマップに子を加える
    fn publish(&self, pin: &DirPin, slot: &SplitSlot, child: PartitionIndex) -> SplitResult<PartitionMap> {
        self.check_cancelled()?;
        let mut next = pin.mapping();
        next.mark_split(child)?;
        self.store.put_mapping(pin.handle(), &next)?;
        Ok(pin.publish_split(slot)?)
    }

    /// 配置済みかもしれない子を捨てる
    ///
    /// 応答が失われただけで相手が受け取っている場合もあるので、失敗時も必ず送る。
    fn abort_placement(&self, dir: DirectoryId, child: PartitionIndex, target: ServerId) {
        if target == self.server_id {
            if let Err(e) = self.store.drop_partition(dir, child) {
                tracing::error!("Failed to drop staged partition {}/{}: {}", dir, child, e);
            }
            return;
        }

        let request = Request::AbortSplit { dir, child };
        match self.transport.call(target, &request, self.place_timeout) {
            Ok(resp) if resp.status.is_ok() => {
                tracing::debug!("Server {} dropped staged partition {}/{}", target, dir, child);
            }
            Ok(resp) => {
                tracing::warn!(
                    "Server {} refused to drop staged partition {}/{}: {:?}",
                    target,
                    dir,
                    child,
                    resp.status
                );
            }
            // 残った保留分はマップに載らず、次の分割で置き換えられる
            Err(e) => {
                tracing::warn!(
                    "Failed to abort staged partition {}/{} on server {}: {}",
                    dir,
                    child,
                    target,
                    e
                );
            }
        }
    }

    /// 公開済みマップを子のサーバーに届ける
    ///
    /// 届かなくても、子のサーバーは保留中の範囲へのリクエストを受けた時点で
    /// 親側のマップを確認して自分で取り込む。
    fn commit_placement(
        &self,
        dir: DirectoryId,
        parent: PartitionIndex,
        child: PartitionIndex,
        target: ServerId,
        published: &PartitionMap,
    ) {
        let request = Request::CommitSplit {
            dir,
            parent,
            child,
            mapping: *published,
        };
        match self.transport.call(target, &request, self.place_timeout) {
            Ok(resp) if resp.status.is_ok() => {}
            Ok(resp) => {
                tracing::error!(
                    "Server {} rejected commit of {}/{} -> {}: {:?}",
                    target,
                    dir,
                    parent,
                    child,
                    resp.status
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Commit of {}/{} -> {} to server {} not confirmed: {}",
                    dir,
                    parent,
                    child,
                    target,
                    e
                );
            }
        }
    }

    /// 親からの削除に失敗した分割をやり直す
    ///
    /// # Returns
    /// まだ残っている件数
    pub fn retry_cleanups(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending_cleanups.lock());
        let mut remaining = Vec::new();
        for cleanup in pending {
            match self
                .store
                .remove_partition_range(cleanup.dir, cleanup.parent, cleanup.child)
            {
                Ok(removed) => {
                    if let Some(pin) = self.cache.lookup(cleanup.dir) {
                        pin.decrement_partition_size(cleanup.parent, removed);
                        self.cache.release(pin);
                    }
                    tracing::info!(
                        "Removed {} moved entries from {}/{} on retry",
                        removed,
                        cleanup.dir,
                        cleanup.parent
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Cleanup of {}/{} -> {} failed again: {}",
                        cleanup.dir,
                        cleanup.parent,
                        cleanup.child,
                        e
                    );
                    remaining.push(cleanup);
                }
            }
        }

        let mut pending = self.pending_cleanups.lock();
        pending.extend(remaining);
        pending.len()
    }

    pub fn pending_cleanups(&self) -> usize {
        self.pending_cleanups.lock().len()
    }

    fn place(
        &self,
        dir: DirectoryId,
        parent: PartitionIndex,
        child: PartitionIndex,
        target: ServerId,
        summary: &ScanSummary,
        post_split: &PartitionMap,
    ) -> SplitResult<()> {
        let loaded = if target == self.server_id {
            self.store.bulk_load(&summary.unit, summary.range)?
        } else {
            let request = Request::Split {
                dir,
                parent,
                child,
                unit: summary.unit.clone(),
                range: summary.range,
                count: summary.count,
                mapping: *post_split,
            };

            let response = self
                .transport
                .call(target, &request, self.place_timeout)
                .map_err(|source| SplitError::Placement {
                    child,
                    target,
                    source,
                })?;

            match (response.status, response.reply) {
                (Status::Ok, Reply::Loaded(n)) => n,
                (status, _) => {
                    return Err(SplitError::Rejected {
                        child,
                        target,
                        status,
                    })
                }
            }
        };

        if loaded != summary.count {
            return Err(SplitError::CountMismatch {
                expected: summary.count,
                actual: loaded,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use crate::metadata::{belongs_to_child, EntryRecord, IdGenerator};
    use crate::rpc::handlers::MetadataServer;
    use crate::rpc::protocol::Operation;
    use crate::rpc::{LocalTransport, RpcHandler};
    use crate::split::SplitTaskQueue;
    use crate::storage::faulty::FaultyStore;
    use crate::storage::InMemoryStore;

    const DIR: u64 = 10;

    fn setup(
        server_count: u32,
        threshold: u64,
    ) -> (SplitCoordinator, Arc<DirectoryCache>, Arc<InMemoryStore>, Arc<LocalTransport>) {
        let cache = Arc::new(DirectoryCache::with_capacity(16, 1));
        let store = Arc::new(InMemoryStore::new());
        let transport = Arc::new(LocalTransport::new(server_count));
        let coordinator = SplitCoordinator::new(
            0,
            cache.clone(),
            store.clone(),
            transport.clone(),
            threshold,
            Duration::from_millis(200),
        );
        (coordinator, cache, store, transport)
    }

    fn populate(store: &InMemoryStore, n: u64) {
        for i in 0..n {
            store
                .put(DIR, 0, &format!("file{}", i), EntryRecord::file(i + 1, 0o644))
                .unwrap();
        }
    }

    #[test]
    fn test_local_split_publishes() {
        // サーバー1台: 子もローカルに置かれる
        let (coordinator, cache, store, _) = setup(1, 10);
        populate(&store, 100);
        drop(cache.insert(DIR, CacheEntry::new(DIR, PartitionMap::new(0, 1).unwrap())));

        let outcome = coordinator.run_task(SplitTask::new(DIR, 0)).unwrap();
        let SplitOutcome::Published { child, moved, mapping, target, .. } = outcome else {
            panic!("expected a published split, got {:?}", outcome);
        };
        assert_eq!(child, 1);
        assert_eq!(target, 0);
        assert_eq!(mapping.radix(), 1);

        let parent_len = store.partition_len(DIR, 0).unwrap();
        let child_len = store.partition_len(DIR, 1).unwrap();
        assert_eq!(child_len, moved);
        assert_eq!(parent_len + child_len, 100);
        for (name, _) in store.list_partition(DIR, 1).unwrap() {
            assert!(belongs_to_child(&name, 1));
        }

        let pin = cache.lookup(DIR).unwrap();
        assert!(pin.mapping().exists(1));
        assert!(pin.split_in_progress().is_none());
        assert_eq!(pin.partition_size(1), moved);
        assert_eq!(store.get_mapping(DIR).unwrap(), Some(mapping));
    }

    #[test]
    fn test_below_threshold_and_not_cached() {
        let (coordinator, cache, store, _) = setup(1, 1000);
        assert_eq!(
            coordinator.run_task(SplitTask::new(DIR, 0)).unwrap(),
            SplitOutcome::Skipped(SkipReason::NotCached)
        );

        populate(&store, 10);
        drop(cache.insert(DIR, CacheEntry::new(DIR, PartitionMap::new(0, 1).unwrap())));
        assert_eq!(
            coordinator.run_task(SplitTask::new(DIR, 0)).unwrap(),
            SplitOutcome::Skipped(SkipReason::BelowThreshold)
        );
    }

    #[test]
    fn test_not_owner() {
        let (coordinator, cache, store, _) = setup(2, 1);
        populate(&store, 10);
        drop(cache.insert(DIR, CacheEntry::new(DIR, PartitionMap::new(1, 2).unwrap())));

        // パーティション0はサーバー1の担当
        assert_eq!(
            coordinator.run_task(SplitTask::new(DIR, 0)).unwrap(),
            SplitOutcome::Skipped(SkipReason::NotOwner)
        );
    }

    #[test]
    fn test_placement_failure_leaves_state_unchanged() {
        let (coordinator, cache, store, transport) = setup(2, 10);
        populate(&store, 100);
        drop(cache.insert(DIR, CacheEntry::new(DIR, PartitionMap::new(0, 2).unwrap())));
        transport.set_unreachable(1, true);

        let err = coordinator.run_task(SplitTask::new(DIR, 0)).unwrap_err();
        assert!(matches!(err, SplitError::Placement { child: 1, target: 1, .. }));

        let pin = cache.lookup(DIR).unwrap();
        assert_eq!(pin.mapping().radix(), 0);
        assert!(pin.split_in_progress().is_none());
        assert_eq!(store.partition_len(DIR, 0).unwrap(), 100);
        assert!(store.get_mapping(DIR).unwrap().is_none());
    }

    #[test]
    fn test_slot_held_skips() {
        let (coordinator, cache, store, _) = setup(1, 10);
        populate(&store, 100);
        let pin = cache.insert(DIR, CacheEntry::new(DIR, PartitionMap::new(0, 1).unwrap()));

        let _slot = pin.entry().try_begin_split(0, 1).unwrap();
        assert_eq!(
            coordinator.split(&pin, 0).unwrap(),
            SplitOutcome::Skipped(SkipReason::SplitInProgress)
        );
    }

    #[test]
    fn test_cancelled_before_extract() {
        let (coordinator, cache, store, _) = setup(1, 10);
        populate(&store, 100);
        drop(cache.insert(DIR, CacheEntry::new(DIR, PartitionMap::new(0, 1).unwrap())));

        coordinator.cancel();
        assert!(matches!(
            coordinator.run_task(SplitTask::new(DIR, 0)),
            Err(SplitError::Cancelled)
        ));
        assert_eq!(store.partition_len(DIR, 0).unwrap(), 100);
        assert!(cache.lookup(DIR).unwrap().split_in_progress().is_none());
    }

    fn remote(transport: &Arc<LocalTransport>) -> Arc<MetadataServer> {
        let server = Arc::new(MetadataServer::new(
            1,
            2,
            Arc::new(DirectoryCache::with_capacity(16, 1)),
            Arc::new(InMemoryStore::new()),
            transport.clone(),
            Arc::new(SplitTaskQueue::new()),
            IdGenerator::new(1).unwrap(),
            1000,
            Duration::from_secs(1),
        ));
        let handler: Arc<dyn RpcHandler> = server.clone();
        transport.register(1, &handler);
        server
    }

    fn faulty_setup(
        server_count: u32,
    ) -> (SplitCoordinator, Arc<DirectoryCache>, Arc<FaultyStore>, Arc<LocalTransport>) {
        let cache = Arc::new(DirectoryCache::with_capacity(16, 1));
        let store = Arc::new(FaultyStore::new());
        let transport = Arc::new(LocalTransport::new(server_count));
        let coordinator = SplitCoordinator::new(
            0,
            cache.clone(),
            store.clone(),
            transport.clone(),
            10,
            Duration::from_millis(200),
        );
        (coordinator, cache, store, transport)
    }

    #[test]
    fn test_lost_placement_reply_aborts_on_target() {
        let (coordinator, cache, store, transport) = setup(2, 10);
        let target = remote(&transport);
        populate(&store, 100);
        drop(cache.insert(DIR, CacheEntry::new(DIR, PartitionMap::new(0, 2).unwrap())));

        // 相手は受け取ったが応答が届かない
        transport.set_reply_lost(1, Operation::Split, true);
        let err = coordinator.run_task(SplitTask::new(DIR, 0)).unwrap_err();
        assert!(matches!(
            err,
            SplitError::Placement {
                source: RpcError::Timeout { .. },
                ..
            }
        ));
        assert_eq!(target.store().partition_len(DIR, 1).unwrap(), 0);
        assert_eq!(target.stats().splits_aborted, 1);
        assert!(target.store().get_mapping(DIR).unwrap().is_none());
        assert_eq!(cache.lookup(DIR).unwrap().mapping().radix(), 0);
        assert_eq!(store.partition_len(DIR, 0).unwrap(), 100);

        transport.set_reply_lost(1, Operation::Split, false);
        let outcome = coordinator.run_task(SplitTask::new(DIR, 0)).unwrap();
        let SplitOutcome::Published { moved, mapping, .. } = outcome else {
            panic!("expected a published split, got {:?}", outcome);
        };
        assert_eq!(target.store().partition_len(DIR, 1).unwrap(), moved);
        assert_eq!(target.store().get_mapping(DIR).unwrap(), Some(mapping));
        assert_eq!(target.stats().splits_received, 1);
        assert_eq!(store.partition_len(DIR, 0).unwrap() + moved, 100);
    }

    #[test]
    fn test_publish_failure_aborts_on_target() {
        let (coordinator, cache, store, transport) = faulty_setup(2);
        let target = remote(&transport);
        populate(store.inner(), 100);
        drop(cache.insert(DIR, CacheEntry::new(DIR, PartitionMap::new(0, 2).unwrap())));

        store.fail_put_mapping(true);
        assert!(matches!(
            coordinator.run_task(SplitTask::new(DIR, 0)),
            Err(SplitError::Storage(_))
        ));
        assert_eq!(target.store().partition_len(DIR, 1).unwrap(), 0);
        assert_eq!(target.stats().splits_aborted, 1);
        assert_eq!(target.stats().splits_received, 0);

        let pin = cache.lookup(DIR).unwrap();
        assert_eq!(pin.mapping().radix(), 0);
        assert!(pin.split_in_progress().is_none());
    }

    #[test]
    fn test_failed_parent_cleanup_is_retried() {
        let (coordinator, cache, store, _) = faulty_setup(1);
        populate(store.inner(), 100);
        drop(cache.insert(DIR, CacheEntry::new(DIR, PartitionMap::new(0, 1).unwrap())));

        store.fail_remove_range(1);
        let outcome = coordinator.run_task(SplitTask::new(DIR, 0)).unwrap();
        let SplitOutcome::Published {
            moved,
            cleanup_pending,
            ..
        } = outcome
        else {
            panic!("expected a published split, got {:?}", outcome);
        };
        assert!(cleanup_pending);
        assert_eq!(coordinator.pending_cleanups(), 1);
        assert_eq!(store.partition_len(DIR, 0).unwrap(), 100);
        assert_eq!(store.partition_len(DIR, 1).unwrap(), moved);

        assert_eq!(coordinator.retry_cleanups(), 0);
        assert_eq!(store.partition_len(DIR, 0).unwrap() + moved, 100);
        for (name, _) in store.list_partition(DIR, 0).unwrap() {
            assert!(!belongs_to_child(&name, 1));
        }
        let pin = cache.lookup(DIR).unwrap();
        assert_eq!(pin.partition_size(0), 100 - moved);
    }
}
