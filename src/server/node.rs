use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::cache::{CachePolicy, DirectoryCache};
use crate::config::{defaults, ServerConfig};
use crate::metadata::{IdGenerator, IdGeneratorError, ServerId};
use crate::rpc::handlers::MetadataServer;
use crate::rpc::{RpcHandler, Transport};
use crate::split::{SplitCoordinator, SplitError, SplitOutcome, SplitTask, SplitTaskQueue};
use crate::storage::{InMemoryStore, MetadataStore, StorageError};

/// サーバーノードのエラー
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Id generator error: {0}")]
    IdGenerator(#[from] IdGeneratorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server {server_id} is outside a cluster of {server_count}")]
    InvalidServerId { server_id: ServerId, server_count: u32 },
}

/// Everything a node needs besides its transport
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub server_id: ServerId,
    pub server_count: u32,
    pub split_threshold: u64,
    pub place_timeout: Duration,
    pub rpc_timeout: Duration,
    pub directory_cache: CachePolicy,
    /// Snapshot directory; `None` keeps metadata in memory only
    pub data_dir: Option<PathBuf>,
}

impl NodeOptions {
    pub fn new(server_id: ServerId, server_count: u32) -> Self {
        Self {
            server_id,
            server_count,
            split_threshold: defaults::SPLIT_THRESHOLD,
            place_timeout: Duration::from_secs(defaults::SPLIT_PLACE_TIMEOUT_SECS),
            rpc_timeout: Duration::from_secs(defaults::TIMEOUT_SECS),
            directory_cache: CachePolicy::lru(defaults::DIRECTORY_CACHE_ENTRIES)
                .with_shards(defaults::DIRECTORY_CACHE_SHARDS),
            data_dir: None,
        }
    }

    pub fn from_config(config: &ServerConfig, server_count: u32) -> Self {
        Self {
            server_id: config.node.server_id,
            server_count,
            split_threshold: config.split.threshold,
            place_timeout: config.place_timeout(),
            rpc_timeout: config.rpc_timeout(),
            directory_cache: config.cache.directory_policy(),
            data_dir: config.node.data_dir.clone(),
        }
    }

    pub fn with_split_threshold(mut self, threshold: u64) -> Self {
        self.split_threshold = threshold;
        self
    }

    pub fn with_place_timeout(mut self, timeout: Duration) -> Self {
        self.place_timeout = timeout;
        self
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("server_{}.snapshot", self.server_id)))
    }
}

/// One running metadata server: request handler plus split thread
pub struct ServerNode {
    server_id: ServerId,
    handler: Arc<MetadataServer>,
    store: Arc<InMemoryStore>,
    queue: Arc<SplitTaskQueue>,
    coordinator: Arc<SplitCoordinator>,
    split_thread: Option<JoinHandle<()>>,
    snapshot_path: Option<PathBuf>,
}

impl ServerNode {
    /// Build the node's state and start its split thread
    pub fn start(options: NodeOptions, transport: Arc<dyn Transport>) -> Result<Self, NodeError> {
        if options.server_id >= options.server_count {
            return Err(NodeError::InvalidServerId {
                server_id: options.server_id,
                server_count: options.server_count,
            });
        }

        let snapshot_path = options.snapshot_path();
        let store = match &snapshot_path {
            Some(path) if path.exists() => Arc::new(InMemoryStore::load_snapshot(path)?),
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Arc::new(InMemoryStore::new())
            }
            None => Arc::new(InMemoryStore::new()),
        };
        let dyn_store: Arc<dyn MetadataStore> = store.clone();

        let cache = Arc::new(DirectoryCache::new(&options.directory_cache));
        let queue = Arc::new(SplitTaskQueue::new());

        let handler = Arc::new(MetadataServer::new(
            options.server_id,
            options.server_count,
            Arc::clone(&cache),
            Arc::clone(&dyn_store),
            Arc::clone(&transport),
            Arc::clone(&queue),
            IdGenerator::new(options.server_id)?,
            options.split_threshold,
            options.rpc_timeout,
        ));
        handler.bootstrap_root()?;

        let coordinator = Arc::new(SplitCoordinator::new(
            options.server_id,
            Arc::clone(&cache),
            dyn_store,
            transport,
            options.split_threshold,
            options.place_timeout,
        ));

        let split_thread = {
            let queue = Arc::clone(&queue);
            let coordinator = Arc::clone(&coordinator);
            let cache = Arc::clone(&cache);
            thread::Builder::new()
                .name(format!("shardfs-split-{}", options.server_id))
                .spawn(move || split_loop(&queue, &coordinator, &cache))?
        };

        tracing::info!(
            "Server {} of {} started (split threshold {})",
            options.server_id,
            options.server_count,
            options.split_threshold
        );

        Ok(Self {
            server_id: options.server_id,
            handler,
            store,
            queue,
            coordinator,
            split_thread: Some(split_thread),
            snapshot_path,
        })
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn handler(&self) -> Arc<dyn RpcHandler> {
        self.handler.clone()
    }

    pub fn metadata_server(&self) -> &Arc<MetadataServer> {
        &self.handler
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<SplitTaskQueue> {
        &self.queue
    }

    pub fn coordinator(&self) -> &Arc<SplitCoordinator> {
        &self.coordinator
    }

    /// Wait until no split is queued or running, up to `timeout`
    pub fn wait_for_splits(&self, timeout: Duration) -> bool {
        self.queue.wait_idle(timeout)
    }

    /// Stop the split thread and save the snapshot, if configured
    pub fn shutdown(&mut self) -> Result<(), NodeError> {
        let Some(handle) = self.split_thread.take() else {
            return Ok(());
        };

        self.coordinator.cancel();
        self.queue.shutdown();
        if handle.join().is_err() {
            tracing::error!("Split thread of server {} panicked", self.server_id);
        }

        if let Some(path) = &self.snapshot_path {
            self.store.save_snapshot(path)?;
        }
        let stats = self.handler.cache().stats();
        tracing::info!(
            "Server {} stopped (directory cache {}/{} entries, {:.0}% full)",
            self.server_id,
            stats.entries,
            stats.capacity,
            stats.utilization() * 100.0
        );
        Ok(())
    }
}

impl Drop for ServerNode {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Shutdown of server {} failed: {}", self.server_id, e);
        }
    }
}

/// 親パーティションの後始末を再試行する間隔
const CLEANUP_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// 分割スレッド本体
fn split_loop(queue: &SplitTaskQueue, coordinator: &SplitCoordinator, cache: &DirectoryCache) {
    tracing::debug!("Split thread started");
    loop {
        let task = if coordinator.pending_cleanups() > 0 {
            match queue.pop_timeout(CLEANUP_RETRY_INTERVAL) {
                Some(task) => task,
                None if queue.is_shutdown() => break,
                None => {
                    coordinator.retry_cleanups();
                    continue;
                }
            }
        } else {
            match queue.pop_blocking() {
                Some(task) => task,
                None => break,
            }
        };

        let result = coordinator.run_task(task);
        match result {
            Ok(SplitOutcome::Published {
                parent,
                child,
                target,
                cleanup_pending,
                ..
            }) => {
                if cleanup_pending {
                    tracing::warn!("Split {:?} published, parent cleanup pending", task);
                } else {
                    requeue_if_oversized(queue, coordinator, cache, task, parent);
                }
                if target == coordinator.server_id() {
                    requeue_if_oversized(queue, coordinator, cache, task, child);
                }
            }
            Ok(SplitOutcome::Skipped(reason)) => {
                tracing::debug!("Split {:?} skipped: {:?}", task, reason);
            }
            Err(SplitError::Cancelled) => {
                tracing::debug!("Split {:?} cancelled", task);
                queue.task_done();
                break;
            }
            Err(e) => {
                tracing::warn!("Split {:?} aborted: {}", task, e);
            }
        }
        queue.task_done();
    }
    tracing::debug!("Split thread stopped");
}

// 偏ったハッシュ分布では分割後も閾値を超えていることがある
fn requeue_if_oversized(
    queue: &SplitTaskQueue,
    coordinator: &SplitCoordinator,
    cache: &DirectoryCache,
    task: SplitTask,
    partition: u32,
) {
    let Some(pin) = cache.lookup(task.directory) else {
        return;
    };
    if pin.partition_size(partition) >= coordinator.threshold() {
        queue.push(SplitTask::new(task.directory, partition));
    }
    cache.release(pin);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::LocalTransport;

    #[test]
    fn test_rejects_out_of_range_server() {
        let transport = Arc::new(LocalTransport::new(2));
        let result = ServerNode::start(NodeOptions::new(2, 2), transport);
        assert!(matches!(result, Err(NodeError::InvalidServerId { .. })));
    }

    #[test]
    fn test_start_and_shutdown() {
        let transport = Arc::new(LocalTransport::new(1));
        let mut node = ServerNode::start(NodeOptions::new(0, 1), transport).unwrap();
        assert!(node.metadata_server().cache().contains(0));
        node.shutdown().unwrap();
        assert!(node.queue().is_shutdown());
        // 2回目は何もしない
        node.shutdown().unwrap();
    }

    #[test]
    fn test_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = NodeOptions::new(0, 1);
        options.data_dir = Some(dir.path().join("data"));

        {
            let transport = Arc::new(LocalTransport::new(1));
            let mut node = ServerNode::start(options.clone(), transport.clone()).unwrap();
            let resp = node.handler().handle(crate::rpc::Request::MkNod {
                dir: crate::metadata::DirRef::root(),
                name: "kept".to_string(),
                mode: 0o644,
            });
            assert!(resp.status.is_ok());
            node.shutdown().unwrap();
        }

        let transport = Arc::new(LocalTransport::new(1));
        let node = ServerNode::start(options, transport).unwrap();
        assert_eq!(node.store().total_entries(), 1);
        assert_eq!(
            node.metadata_server()
                .cache()
                .lookup(0)
                .unwrap()
                .partition_size(0),
            1
        );
    }
}
