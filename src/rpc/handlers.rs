use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::cache::{CacheEntry, DirPin, DirectoryCache};
use crate::constants::{is_valid_name, should_trigger_split, MAX_INLINE_DATA};
use crate::metadata::{
    belongs_to_child, index_for_name, server_for_name, DirRef, DirectoryId, DirectoryListing, EntryRecord,
    IdGenerator, PartitionIndex, PartitionMap, ServerId, ROOT_DIRECTORY_ID, ROOT_ZEROTH_SERVER,
};
use crate::rpc::protocol::{Reply, Request, Response, Status};
use crate::rpc::transport::{RpcHandler, Transport};
use crate::split::{SplitTask, SplitTaskQueue};
use crate::storage::{MetadataStore, SequenceRange, StorageError, TransportUnit};

/// Server-side counters
#[derive(Debug, Default)]
pub struct HandlerStats {
    pub requests: AtomicU64,
    pub stale_replies: AtomicU64,
    pub retry_replies: AtomicU64,
    pub map_fetches: AtomicU64,
    pub splits_received: AtomicU64,
    pub splits_aborted: AtomicU64,
}

impl HandlerStats {
    pub fn snapshot(&self) -> HandlerStatsSnapshot {
        HandlerStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            stale_replies: self.stale_replies.load(Ordering::Relaxed),
            retry_replies: self.retry_replies.load(Ordering::Relaxed),
            map_fetches: self.map_fetches.load(Ordering::Relaxed),
            splits_received: self.splits_received.load(Ordering::Relaxed),
            splits_aborted: self.splits_aborted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerStatsSnapshot {
    pub requests: u64,
    pub stale_replies: u64,
    pub retry_replies: u64,
    pub map_fetches: u64,
    pub splits_received: u64,
    pub splits_aborted: u64,
}

fn storage_status(e: &StorageError) -> Status {
    match e {
        StorageError::NotFound(_) => Status::NotFound,
        StorageError::AlreadyExists(_) => Status::AlreadyExists,
        StorageError::NotAChild { .. } | StorageError::SequenceOutOfRange { .. } => {
            Status::InvalidArgument
        }
        _ => Status::IoError,
    }
}

/// 受け取り済みで commit 待ちの子パーティション
#[derive(Debug, Clone, Copy)]
struct StagedSplit {
    parent: PartitionIndex,
    /// 親パーティションを持つサーバー
    source: ServerId,
    count: u64,
}

/// One metadata server's request handling
///
/// The server never forwards: a request whose name resolves to another
/// server under this server's map is refused with `StaleMapping` and the
/// map attached.
pub struct MetadataServer {
    server_id: ServerId,
    server_count: u32,
    cache: Arc<DirectoryCache>,
    store: Arc<dyn MetadataStore>,
    transport: Arc<dyn Transport>,
    queue: Arc<SplitTaskQueue>,
    ids: IdGenerator,
    split_threshold: u64,
    rpc_timeout: Duration,
    staged: Mutex<HashMap<(DirectoryId, PartitionIndex), StagedSplit>>,
    stats: HandlerStats,
}

impl MetadataServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_id: ServerId,
        server_count: u32,
        cache: Arc<DirectoryCache>,
        store: Arc<dyn MetadataStore>,
        transport: Arc<dyn Transport>,
        queue: Arc<SplitTaskQueue>,
        ids: IdGenerator,
        split_threshold: u64,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            server_id,
            server_count,
            cache,
            store,
            transport,
            queue,
            ids,
            split_threshold,
            rpc_timeout,
            staged: Mutex::new(HashMap::new()),
            stats: HandlerStats::default(),
        }
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn cache(&self) -> &Arc<DirectoryCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn stats(&self) -> HandlerStatsSnapshot {
        self.stats.snapshot()
    }

    /// ルートディレクトリのマップを用意する (zeroth server のみ)
    pub fn bootstrap_root(&self) -> Result<(), StorageError> {
        if self.server_id != ROOT_ZEROTH_SERVER {
            return Ok(());
        }

        let mapping = match self.store.get_mapping(ROOT_DIRECTORY_ID)? {
            Some(mapping) => mapping,
            None => {
                let mapping = PartitionMap::new(ROOT_ZEROTH_SERVER, self.server_count)
                    .map_err(|e| StorageError::Internal(e.to_string()))?;
                self.store.put_mapping(ROOT_DIRECTORY_ID, &mapping)?;
                mapping
            }
        };

        let pin = self
            .cache
            .insert_or_merge(ROOT_DIRECTORY_ID, self.new_entry(ROOT_DIRECTORY_ID, mapping));
        tracing::info!(
            "Root directory ready on server {} ({:?})",
            self.server_id,
            pin.mapping()
        );
        Ok(())
    }

    /// 自サーバー担当パーティションのサイズを初期化したキャッシュエントリ
    fn new_entry(&self, dir: DirectoryId, mapping: PartitionMap) -> CacheEntry {
        let entry = CacheEntry::new(dir, mapping);
        for partition in mapping.partitions_on(self.server_id) {
            match self.store.partition_len(dir, partition) {
                Ok(len) => entry.set_partition_size(partition, len),
                Err(e) => tracing::warn!("Failed to size {}/{}: {}", dir, partition, e),
            }
        }
        entry
    }

    /// ディレクトリをピンする
    ///
    /// キャッシュ → 永続化されたマップ → zeroth server からの取得、の順に探す。
    fn pin_directory(&self, dir: DirRef) -> Result<DirPin, Status> {
        if let Some(pin) = self.cache.lookup(dir.id) {
            return Ok(pin);
        }

        match self.store.get_mapping(dir.id) {
            Ok(Some(mapping)) => {
                tracing::debug!("Loaded map of directory {} from storage", dir.id);
                return Ok(self
                    .cache
                    .insert_or_merge(dir.id, self.new_entry(dir.id, mapping)));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("Failed to load map of directory {}: {}", dir.id, e);
                return Err(Status::IoError);
            }
        }

        if dir.zeroth_server == self.server_id {
            tracing::debug!("Directory {} unknown on its zeroth server", dir.id);
            return Err(Status::DirectoryUnknown);
        }

        self.stats.map_fetches.fetch_add(1, Ordering::Relaxed);
        let request = Request::GetPartitionMap { dir };
        match self.transport.call(dir.zeroth_server, &request, self.rpc_timeout) {
            Ok(Response {
                status: Status::Ok,
                reply: Reply::Mapping(mapping),
                ..
            }) => {
                tracing::debug!(
                    "Fetched map of directory {} from server {}",
                    dir.id,
                    dir.zeroth_server
                );
                let pin = self
                    .cache
                    .insert_or_merge(dir.id, self.new_entry(dir.id, mapping));
                self.adopt_published(dir.id, &pin);
                Ok(pin)
            }
            Ok(resp) => {
                tracing::debug!(
                    "Server {} has no map for directory {}: {:?}",
                    dir.zeroth_server,
                    dir.id,
                    resp.status
                );
                Err(Status::DirectoryUnknown)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to fetch map of directory {} from server {}: {}",
                    dir.id,
                    dir.zeroth_server,
                    e
                );
                Err(Status::DirectoryUnknown)
            }
        }
    }

    /// リクエストを処理する
    #[instrument(level = "trace", skip_all, fields(server = self.server_id))]
    pub fn dispatch(&self, request: Request) -> Response {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        match request {
            Request::GetPartitionMap { dir } => self.handle_get_partition_map(dir),
            Request::ReadDir { dir, partition } => self.handle_readdir(dir, partition),
            Request::Split {
                dir,
                parent,
                child,
                unit,
                range,
                count,
                mapping,
            } => self.handle_split(dir, parent, child, &unit, range, count, &mapping),
            Request::CommitSplit {
                dir,
                parent,
                child,
                mapping,
            } => self.handle_commit_split(dir, parent, child, &mapping),
            Request::AbortSplit { dir, child } => self.handle_abort_split(dir, child),
            Request::DropDirectory { dir } => self.handle_drop_directory(dir),
            request => self.handle_routed(request),
        }
    }

    /// 名前でルーティングされる操作
    fn handle_routed(&self, request: Request) -> Response {
        let Some((dir, name)) = request.routing_key() else {
            return Response::error(Status::InvalidArgument);
        };

        let pin = match self.pin_directory(dir) {
            Ok(pin) => pin,
            Err(status) => return Response::error(status),
        };

        let mutation = request.is_mutation();
        let gate = mutation.then(|| pin.mutation_guard());

        let mapping = pin.mapping();
        let (index, owner) = server_for_name(&mapping, name);
        if owner != self.server_id {
            if let Some((child, staged)) = self.staged_for(dir.id, name) {
                // クライアントは公開済みのマップを見ている。commit が届いていない
                drop(gate);
                if self.settle_staged(dir, child, staged) {
                    return self.handle_routed(request);
                }
                self.stats.retry_replies.fetch_add(1, Ordering::Relaxed);
                return Response::retry(mapping);
            }

            self.stats.stale_replies.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                "Stale mapping for {}/{}: owned by server {} (radix {})",
                dir.id,
                name,
                owner,
                mapping.radix()
            );
            return Response::stale(mapping);
        }

        if mutation {
            if let Some(split) = pin.split_in_progress() {
                if split.parent == index && belongs_to_child(name, split.child) {
                    self.stats.retry_replies.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        "{}/{} is moving to partition {}, asking client to retry",
                        dir.id,
                        name,
                        split.child
                    );
                    return Response::retry(mapping);
                }
            }
        }

        let dir_id = dir.id;
        let name = name.to_string();
        match request {
            Request::GetAttr { .. } | Request::Lookup { .. } => {
                self.handle_getattr(dir_id, index, &name)
            }
            Request::MkDir { mode, .. } => self.handle_mkdir(&pin, index, &name, mode),
            Request::MkNod { mode, .. } => self.handle_mknod(&pin, index, &name, mode),
            Request::Write { offset, data, .. } => {
                self.handle_write(dir_id, index, &name, offset, &data)
            }
            Request::Read { offset, length, .. } => {
                self.handle_read(dir_id, index, &name, offset, length)
            }
            Request::Remove { .. } => self.handle_remove(&pin, index, &name),
            Request::Chmod { mode, .. } => self.handle_chmod(dir_id, index, &name, mode),
            _ => Response::error(Status::InvalidArgument),
        }
    }

    fn handle_getattr(&self, dir: DirectoryId, index: PartitionIndex, name: &str) -> Response {
        match self.store.get(dir, index, name) {
            Ok(entry) => Response::ok(Reply::Attr(entry.attr())),
            Err(e) => Response::error(storage_status(&e)),
        }
    }

    /// エントリ追加後のサイズ更新と分割トリガー
    fn note_insert(&self, pin: &DirPin, index: PartitionIndex) {
        let size = pin.increment_partition_size(index);
        if should_trigger_split(size, self.split_threshold) {
            self.queue.push(SplitTask::new(pin.handle(), index));
        }
    }

    fn handle_mknod(&self, pin: &DirPin, index: PartitionIndex, name: &str, mode: u32) -> Response {
        if !is_valid_name(name) {
            return Response::error(Status::InvalidArgument);
        }
        let inode = match self.ids.next_id() {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("Failed to allocate inode: {}", e);
                return Response::error(Status::IoError);
            }
        };

        let entry = EntryRecord::file(inode, mode);
        let attr = entry.attr();
        match self.store.insert_new(pin.handle(), index, name, entry) {
            Ok(()) => {
                tracing::debug!("Created {}/{} (inode {})", pin.handle(), name, inode);
                self.note_insert(pin, index);
                Response::ok(Reply::Attr(attr))
            }
            Err(e) => Response::error(storage_status(&e)),
        }
    }

    /// 新しいディレクトリのマップはこのサーバーを zeroth として生まれる
    fn handle_mkdir(&self, pin: &DirPin, index: PartitionIndex, name: &str, mode: u32) -> Response {
        if !is_valid_name(name) {
            return Response::error(Status::InvalidArgument);
        }
        let inode = match self.ids.next_id() {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("Failed to allocate inode: {}", e);
                return Response::error(Status::IoError);
            }
        };
        let mapping = match PartitionMap::new(self.server_id, self.server_count) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("Failed to create map: {}", e);
                return Response::error(Status::IoError);
            }
        };

        if let Err(e) = self.store.put_mapping(inode, &mapping) {
            tracing::error!("Failed to persist map of new directory {}: {}", inode, e);
            return Response::error(Status::IoError);
        }

        let entry = EntryRecord::directory(inode, mode, self.server_id);
        let attr = entry.attr();
        match self.store.insert_new(pin.handle(), index, name, entry) {
            Ok(()) => {
                tracing::debug!("Created directory {}/{} (inode {})", pin.handle(), name, inode);
                self.note_insert(pin, index);
                Response::ok(Reply::Attr(attr))
            }
            Err(e) => {
                if let Err(rollback) = self.store.delete_mapping(inode) {
                    tracing::error!(
                        "Failed to roll back map of directory {}: {}",
                        inode,
                        rollback
                    );
                }
                Response::error(storage_status(&e))
            }
        }
    }

    fn handle_write(
        &self,
        dir: DirectoryId,
        index: PartitionIndex,
        name: &str,
        offset: u64,
        data: &[u8],
    ) -> Response {
        if offset.saturating_add(data.len() as u64) > MAX_INLINE_DATA {
            return Response::error(Status::InvalidArgument);
        }

        let mut is_dir = false;
        let mut written = 0u64;
        let result = self.store.update(dir, index, name, &mut |entry| {
            if entry.is_directory() {
                is_dir = true;
            } else {
                written = entry.write_at(offset, data) as u64;
            }
        });

        match result {
            Ok(_) if is_dir => Response::error(Status::IsADirectory),
            Ok(_) => Response::ok(Reply::Written(written)),
            Err(e) => Response::error(storage_status(&e)),
        }
    }

    fn handle_read(
        &self,
        dir: DirectoryId,
        index: PartitionIndex,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Response {
        match self.store.get(dir, index, name) {
            Ok(entry) if entry.is_directory() => Response::error(Status::IsADirectory),
            Ok(entry) => Response::ok(Reply::Data(entry.read_at(offset, length).to_vec())),
            Err(e) => Response::error(storage_status(&e)),
        }
    }

    fn handle_remove(&self, pin: &DirPin, index: PartitionIndex, name: &str) -> Response {
        match self.store.delete(pin.handle(), index, name) {
            Ok(entry) => {
                pin.decrement_partition_size(index, 1);
                tracing::debug!("Removed {}/{}", pin.handle(), name);
                Response::ok(Reply::Attr(entry.attr()))
            }
            Err(e) => Response::error(storage_status(&e)),
        }
    }

    fn handle_chmod(&self, dir: DirectoryId, index: PartitionIndex, name: &str, mode: u32) -> Response {
        let result = self.store.update(dir, index, name, &mut |entry| {
            entry.permissions = entry.permissions.with_mode(mode);
        });
        match result {
            Ok(entry) => Response::ok(Reply::Attr(entry.attr())),
            Err(e) => Response::error(storage_status(&e)),
        }
    }

    fn handle_get_partition_map(&self, dir: DirRef) -> Response {
        match self.pin_directory(dir) {
            Ok(pin) => Response::ok(Reply::Mapping(pin.mapping())),
            Err(status) => Response::error(status),
        }
    }

    /// 1パーティション分の一覧。マップは常に添付する
    fn handle_readdir(&self, dir: DirRef, partition: PartitionIndex) -> Response {
        let pin = match self.pin_directory(dir) {
            Ok(pin) => pin,
            Err(status) => return Response::error(status),
        };

        let mut mapping = pin.mapping();
        if !mapping.exists(partition) {
            let staged = self.staged.lock().get(&(dir.id, partition)).copied();
            if let Some(split) = staged {
                if !self.settle_staged(dir, partition, split) {
                    self.stats.retry_replies.fetch_add(1, Ordering::Relaxed);
                    return Response::retry(mapping);
                }
                mapping = pin.mapping();
            }
        }
        if !mapping.exists(partition) || mapping.server_for_index(partition) != self.server_id {
            self.stats.stale_replies.fetch_add(1, Ordering::Relaxed);
            return Response::stale(mapping);
        }

        match self.store.list_partition(dir.id, partition) {
            Ok(entries) => {
                // 親からの削除が終わっていない移動済みエントリは子の側で返す
                let listing = entries
                    .into_iter()
                    .filter(|(name, _)| index_for_name(&mapping, name) == partition)
                    .map(|(name, entry)| DirectoryListing {
                        name,
                        inode: entry.inode,
                        inode_type: entry.inode_type,
                    })
                    .collect();
                Response::ok(Reply::Listing(listing)).with_mapping(mapping)
            }
            Err(e) => Response::error(storage_status(&e)).with_mapping(mapping),
        }
    }

    /// 分割の子パーティションを受け取り、commit まで保留する
    ///
    /// 保留中の子はこのサーバーのマップに載らないため、どのリクエストからも見えない。
    #[allow(clippy::too_many_arguments)]
    fn handle_split(
        &self,
        dir: DirectoryId,
        parent: PartitionIndex,
        child: PartitionIndex,
        unit: &TransportUnit,
        range: SequenceRange,
        count: u64,
        mapping: &PartitionMap,
    ) -> Response {
        if unit.directory != dir
            || unit.partition != child
            || !mapping.exists(child)
            || mapping.server_for_index(child) != self.server_id
        {
            tracing::error!(
                "Rejecting split {}/{} -> {}: not addressed to server {}",
                dir,
                parent,
                child,
                self.server_id
            );
            return Response::error(Status::InvalidArgument);
        }

        let mut staged = self.staged.lock();
        match self.known_mapping(dir) {
            Ok(Some(known)) if known.exists(child) => {
                tracing::error!(
                    "Rejecting split {}/{} -> {}: partition already live on server {}",
                    dir,
                    parent,
                    child,
                    self.server_id
                );
                return Response::error(Status::AlreadyExists);
            }
            Ok(_) => {}
            Err(status) => return Response::error(status),
        }

        let loaded = match self.store.bulk_load(unit, range) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Bulk load of {}/{} failed: {}", dir, child, e);
                return Response::error(storage_status(&e));
            }
        };
        if loaded != count {
            tracing::error!(
                "Split {}/{} -> {} carried {} entries, expected {}",
                dir,
                parent,
                child,
                loaded,
                count
            );
            if let Err(e) = self.store.drop_partition(dir, child) {
                tracing::error!("Failed to drop partial partition {}/{}: {}", dir, child, e);
            }
            return Response::error(Status::InvalidArgument);
        }

        staged.insert(
            (dir, child),
            StagedSplit {
                parent,
                source: mapping.server_for_index(parent),
                count: loaded,
            },
        );
        tracing::debug!(
            "Staged partition {} of directory {} from partition {} ({} entries)",
            child,
            dir,
            parent,
            loaded
        );
        Response::ok(Reply::Loaded(loaded))
    }

    /// キャッシュまたはストレージにあるマップ。なければ `None`
    fn known_mapping(&self, dir: DirectoryId) -> Result<Option<PartitionMap>, Status> {
        if let Some(pin) = self.cache.lookup(dir) {
            let mapping = pin.mapping();
            self.cache.release(pin);
            return Ok(Some(mapping));
        }
        self.store.get_mapping(dir).map_err(|e| {
            tracing::error!("Failed to load map of directory {}: {}", dir, e);
            Status::IoError
        })
    }

    fn handle_commit_split(
        &self,
        dir: DirectoryId,
        parent: PartitionIndex,
        child: PartitionIndex,
        mapping: &PartitionMap,
    ) -> Response {
        if !mapping.exists(child) || mapping.server_for_index(child) != self.server_id {
            tracing::error!(
                "Rejecting commit of {}/{} -> {}: not addressed to server {}",
                dir,
                parent,
                child,
                self.server_id
            );
            return Response::error(Status::InvalidArgument);
        }
        match self.commit_staged(dir, child, mapping) {
            Ok(()) => Response::ok(Reply::Empty),
            Err(status) => Response::error(status),
        }
    }

    /// 保留中の子を公開済みマップとともに取り込む
    ///
    /// 既に取り込み済みなら何もしない。
    fn commit_staged(
        &self,
        dir: DirectoryId,
        child: PartitionIndex,
        mapping: &PartitionMap,
    ) -> Result<(), Status> {
        let mut staged = self.staged.lock();
        let Some(split) = staged.get(&(dir, child)).copied() else {
            return match self.known_mapping(dir)? {
                Some(known) if known.exists(child) => Ok(()),
                _ => {
                    tracing::error!("No staged partition {}/{} to commit", dir, child);
                    Err(Status::NotFound)
                }
            };
        };

        let pin = match self.cache.lookup(dir) {
            Some(pin) => pin,
            None => {
                let mut known = *mapping;
                if let Some(stored) = self.known_mapping(dir)? {
                    if let Err(e) = known.merge(&stored) {
                        tracing::warn!("Ignoring persisted map of {}: {}", dir, e);
                    }
                }
                self.cache.insert_or_merge(dir, self.new_entry(dir, known))
            }
        };

        if let Err(e) = pin.merge_mapping(mapping) {
            tracing::warn!("Commit of {} carried an incompatible map: {}", dir, e);
            return Err(Status::InvalidArgument);
        }
        if let Err(e) = self.store.put_mapping(dir, &pin.mapping()) {
            tracing::error!("Failed to persist map of directory {}: {}", dir, e);
            return Err(Status::IoError);
        }
        // 公開済みマップに載った保留分はまとめて取り込まれる
        let merged = pin.mapping();
        staged.retain(|&(d, c), s| {
            if d != dir || !merged.exists(c) {
                return true;
            }
            pin.set_partition_size(c, s.count);
            false
        });
        self.stats.splits_received.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            "Received partition {} of directory {} from partition {} ({} entries)",
            child,
            dir,
            split.parent,
            split.count
        );
        Ok(())
    }

    fn handle_abort_split(&self, dir: DirectoryId, child: PartitionIndex) -> Response {
        let mut staged = self.staged.lock();
        if staged.remove(&(dir, child)).is_none() {
            return match self.known_mapping(dir) {
                // 公開済みの子は消さない
                Ok(Some(known)) if known.exists(child) => {
                    tracing::error!("Refusing to abort live partition {}/{}", dir, child);
                    Response::error(Status::InvalidArgument)
                }
                Ok(_) => Response::ok(Reply::Empty),
                Err(status) => Response::error(status),
            };
        }

        match self.store.drop_partition(dir, child) {
            Ok(dropped) => {
                self.stats.splits_aborted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    "Dropped staged partition {} of directory {} ({} entries)",
                    child,
                    dir,
                    dropped
                );
                Response::ok(Reply::Empty)
            }
            Err(e) => {
                tracing::error!("Failed to drop staged partition {}/{}: {}", dir, child, e);
                Response::error(storage_status(&e))
            }
        }
    }

    /// `name` が保留中の子に属していれば、その子
    fn staged_for(&self, dir: DirectoryId, name: &str) -> Option<(PartitionIndex, StagedSplit)> {
        self.staged
            .lock()
            .iter()
            .find(|((d, child), _)| *d == dir && belongs_to_child(name, *child))
            .map(|((_, child), split)| (*child, *split))
    }

    /// 取得したマップに保留中の子が載っていれば取り込む
    fn adopt_published(&self, dir: DirectoryId, pin: &DirPin) {
        let mapping = pin.mapping();
        let published = self
            .staged
            .lock()
            .keys()
            .find(|(d, child)| *d == dir && mapping.exists(*child))
            .map(|(_, child)| *child);
        if let Some(child) = published {
            if let Err(status) = self.commit_staged(dir, child, &mapping) {
                tracing::warn!("Failed to adopt staged partition {}/{}: {:?}", dir, child, status);
            }
        }
    }

    /// 親側のマップを確認し、公開済みなら自分で commit する
    fn settle_staged(&self, dir: DirRef, child: PartitionIndex, split: StagedSplit) -> bool {
        let request = Request::GetPartitionMap { dir };
        let mapping = match self.transport.call(split.source, &request, self.rpc_timeout) {
            Ok(Response {
                status: Status::Ok,
                reply: Reply::Mapping(mapping),
                ..
            }) => mapping,
            Ok(resp) => {
                tracing::debug!(
                    "Server {} gave no map for {}: {:?}",
                    split.source,
                    dir.id,
                    resp.status
                );
                return false;
            }
            Err(e) => {
                tracing::debug!("Failed to ask server {} about {}: {}", split.source, dir.id, e);
                return false;
            }
        };
        if !mapping.exists(child) {
            return false;
        }
        tracing::debug!(
            "Split {}/{} -> {} published without a commit, adopting it",
            dir.id,
            split.parent,
            child
        );
        self.commit_staged(dir.id, child, &mapping).is_ok()
    }

    fn handle_drop_directory(&self, dir: DirectoryId) -> Response {
        if dir == ROOT_DIRECTORY_ID {
            return Response::error(Status::InvalidArgument);
        }
        if !self.cache.erase(dir) {
            tracing::debug!("Directory {} still pinned, leaving cache entry", dir);
        }
        match self.store.delete_mapping(dir) {
            Ok(()) => Response::ok(Reply::Empty),
            Err(e) => Response::error(storage_status(&e)),
        }
    }
}

impl RpcHandler for MetadataServer {
    fn handle(&self, request: Request) -> Response {
        self.dispatch(request)
    }
}
