//! Client half of the stale-mapping protocol
//!
//! Every routed call resolves its target from the client's cached map. A
//! `StaleMapping` reply carries the server's map, which is merged and the
//! call is re-resolved at once; a `Retry` reply is merged the same way but
//! the client backs off first. Both loops are bounded by [`RetryPolicy`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::cache::{CacheEntry, DirPin, DirectoryCache};
use crate::config::{defaults, NetworkConfig};
use crate::metadata::{
    server_for_name, DirRef, DirectoryListing, EntryAttr, PartitionIndex, PartitionMap,
    ServerId,
};
use crate::rpc::protocol::{Reply, Request, Response, Status};
use crate::rpc::transport::Transport;
use crate::rpc::{RpcError, RpcResult};

/// Bounds on the client's retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per operation, counting the first
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline of a single RPC
    pub rpc_timeout: Duration,
    /// Overall deadline of one operation, across attempts
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_RETRIES,
            base_backoff: Duration::from_millis(defaults::RETRY_BACKOFF_MS),
            max_backoff: Duration::from_millis(defaults::MAX_BACKOFF_MS),
            rpc_timeout: Duration::from_secs(defaults::TIMEOUT_SECS),
            deadline: None,
        }
    }
}

impl RetryPolicy {
    pub fn from_network(config: &NetworkConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_backoff: Duration::from_millis(config.retry_backoff_ms),
            rpc_timeout: Duration::from_secs(config.timeout_secs),
            ..Self::default()
        }
    }

    /// Backoff before retry `attempt` (0-indexed), doubling up to `max_backoff`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn expired(&self, started: Instant) -> bool {
        self.deadline.is_some_and(|d| started.elapsed() >= d)
    }
}

#[derive(Debug, Default)]
struct ClientStats {
    calls: AtomicU64,
    stale_retries: AtomicU64,
    busy_retries: AtomicU64,
    transport_retries: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientStatsSnapshot {
    pub calls: u64,
    pub stale_retries: u64,
    pub busy_retries: u64,
    pub transport_retries: u64,
}

/// What the retry loop does after one attempt
enum Step {
    Done(Response),
    Again { backoff: bool },
}

/// Metadata RPC client
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    server_count: u32,
    policy: RetryPolicy,
    maps: DirectoryCache,
    stats: ClientStats,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        let server_count = transport.server_count();
        Self {
            transport,
            server_count,
            policy,
            maps: DirectoryCache::with_capacity(defaults::DIRECTORY_CACHE_ENTRIES, 4),
            stats: ClientStats::default(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn server_count(&self) -> u32 {
        self.server_count
    }

    pub fn stats(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            calls: self.stats.calls.load(Ordering::Relaxed),
            stale_retries: self.stats.stale_retries.load(Ordering::Relaxed),
            busy_retries: self.stats.busy_retries.load(Ordering::Relaxed),
            transport_retries: self.stats.transport_retries.load(Ordering::Relaxed),
        }
    }

    /// 未知のディレクトリは radix 0 のマップから始める
    fn pin(&self, dir: DirRef) -> RpcResult<DirPin> {
        if let Some(pin) = self.maps.lookup(dir.id) {
            return Ok(pin);
        }
        let initial = PartitionMap::new(dir.zeroth_server, self.server_count)
            .map_err(|e| RpcError::UnexpectedReply(e.to_string()))?;
        Ok(self
            .maps
            .insert_or_merge(dir.id, CacheEntry::new(dir.id, initial)))
    }

    /// The client's current map of `dir`
    pub fn cached_mapping(&self, dir: DirRef) -> RpcResult<PartitionMap> {
        Ok(self.pin(dir)?.mapping())
    }

    /// Merge a map learned out of band
    pub fn learn_mapping(&self, dir: DirRef, mapping: &PartitionMap) -> RpcResult<()> {
        let pin = self.pin(dir)?;
        Self::merge_into(&pin, mapping);
        Ok(())
    }

    /// Forget a directory's map
    pub fn forget_directory(&self, dir: DirRef) {
        self.maps.erase(dir.id);
    }

    fn merge_into(pin: &DirPin, mapping: &PartitionMap) -> bool {
        match pin.merge_mapping(mapping) {
            Ok(changed) => changed,
            Err(e) => {
                tracing::warn!("Ignoring map for directory {}: {}", pin.handle(), e);
                false
            }
        }
    }

    /// 1回分の送受信と、その結果に応じた次の動作
    fn attempt(&self, pin: &DirPin, target: ServerId, request: &Request) -> RpcResult<Step> {
        self.stats.calls.fetch_add(1, Ordering::Relaxed);
        let response = match self.transport.call(target, request, self.policy.rpc_timeout) {
            Ok(response) => response,
            Err(e) if e.is_transient() => {
                tracing::debug!("{:?} to server {} failed: {}", request.operation(), target, e);
                self.stats.transport_retries.fetch_add(1, Ordering::Relaxed);
                return Ok(Step::Again { backoff: true });
            }
            Err(e) => return Err(e),
        };

        match response.status {
            Status::StaleMapping => {
                self.stats.stale_retries.fetch_add(1, Ordering::Relaxed);
                let changed = response
                    .mapping
                    .as_ref()
                    .is_some_and(|m| Self::merge_into(pin, m));
                tracing::trace!(
                    "Stale mapping from server {} for directory {} (learned: {})",
                    target,
                    pin.handle(),
                    changed
                );
                // 何も学べなかった場合は相手の更新を待つ
                Ok(Step::Again { backoff: !changed })
            }
            Status::Retry => {
                self.stats.busy_retries.fetch_add(1, Ordering::Relaxed);
                if let Some(m) = response.mapping.as_ref() {
                    Self::merge_into(pin, m);
                }
                Ok(Step::Again { backoff: true })
            }
            _ => {
                if let Some(m) = response.mapping.as_ref() {
                    Self::merge_into(pin, m);
                }
                Ok(Step::Done(response))
            }
        }
    }

    /// Bounded retry loop; `target` picks the server from the current map
    fn retry_loop<F>(&self, dir: DirRef, request: &Request, target: F) -> RpcResult<Response>
    where
        F: Fn(&PartitionMap) -> ServerId,
    {
        let pin = self.pin(dir)?;
        let started = Instant::now();
        let mut backoffs = 0u32;

        for attempt in 0..self.policy.max_attempts {
            if attempt > 0 && self.policy.expired(started) {
                break;
            }
            let server = target(&pin.mapping());
            match self.attempt(&pin, server, request)? {
                Step::Done(response) => return Ok(response),
                Step::Again { backoff: true } => {
                    thread::sleep(self.policy.backoff_delay(backoffs));
                    backoffs += 1;
                }
                Step::Again { backoff: false } => {}
            }
        }

        tracing::warn!(
            "{:?} on directory {} gave up after {} attempts",
            request.operation(),
            dir.id,
            self.policy.max_attempts
        );
        Err(RpcError::RetryExhausted {
            attempts: self.policy.max_attempts,
        })
    }

    /// Send a name-routed request and return the successful reply
    pub fn call(&self, request: Request) -> RpcResult<Reply> {
        let Some((dir, name)) = request.routing_key() else {
            return Err(RpcError::UnexpectedReply(format!(
                "{:?} is not routed by name",
                request.operation()
            )));
        };
        let name = name.to_string();
        let response = self.retry_loop(dir, &request, |map| server_for_name(map, &name).1)?;
        if response.status.is_ok() {
            Ok(response.reply)
        } else {
            Err(RpcError::Status(response.status))
        }
    }

    fn call_attr(&self, request: Request) -> RpcResult<EntryAttr> {
        match self.call(request)? {
            Reply::Attr(attr) => Ok(attr),
            other => Err(RpcError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub fn getattr(&self, dir: DirRef, name: &str) -> RpcResult<EntryAttr> {
        self.call_attr(Request::GetAttr {
            dir,
            name: name.to_string(),
        })
    }

    pub fn lookup(&self, dir: DirRef, name: &str) -> RpcResult<EntryAttr> {
        self.call_attr(Request::Lookup {
            dir,
            name: name.to_string(),
        })
    }

    pub fn mkdir(&self, dir: DirRef, name: &str, mode: u32) -> RpcResult<EntryAttr> {
        self.call_attr(Request::MkDir {
            dir,
            name: name.to_string(),
            mode,
        })
    }

    pub fn mknod(&self, dir: DirRef, name: &str, mode: u32) -> RpcResult<EntryAttr> {
        self.call_attr(Request::MkNod {
            dir,
            name: name.to_string(),
            mode,
        })
    }

    pub fn write(&self, dir: DirRef, name: &str, offset: u64, data: &[u8]) -> RpcResult<u64> {
        match self.call(Request::Write {
            dir,
            name: name.to_string(),
            offset,
            data: data.to_vec(),
        })? {
            Reply::Written(n) => Ok(n),
            other => Err(RpcError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub fn read(&self, dir: DirRef, name: &str, offset: u64, length: u64) -> RpcResult<Vec<u8>> {
        match self.call(Request::Read {
            dir,
            name: name.to_string(),
            offset,
            length,
        })? {
            Reply::Data(data) => Ok(data),
            other => Err(RpcError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    /// Remove an entry; returns its last attributes
    pub fn remove(&self, dir: DirRef, name: &str) -> RpcResult<EntryAttr> {
        self.call_attr(Request::Remove {
            dir,
            name: name.to_string(),
        })
    }

    pub fn chmod(&self, dir: DirRef, name: &str, mode: u32) -> RpcResult<EntryAttr> {
        self.call_attr(Request::Chmod {
            dir,
            name: name.to_string(),
            mode,
        })
    }

    /// Fetch the map from the directory's zeroth server and merge it
    pub fn get_partition_map(&self, dir: DirRef) -> RpcResult<PartitionMap> {
        let request = Request::GetPartitionMap { dir };
        let response = self.retry_loop(dir, &request, |map| map.zeroth_server())?;
        match (response.status, response.reply) {
            (Status::Ok, Reply::Mapping(mapping)) => {
                self.learn_mapping(dir, &mapping)?;
                self.cached_mapping(dir)
            }
            (Status::Ok, other) => Err(RpcError::UnexpectedReply(format!("{:?}", other))),
            (status, _) => Err(RpcError::Status(status)),
        }
    }

    fn readdir_partition(
        &self,
        dir: DirRef,
        partition: PartitionIndex,
    ) -> RpcResult<Vec<DirectoryListing>> {
        let request = Request::ReadDir { dir, partition };
        let response = self.retry_loop(dir, &request, |map| map.server_for_index(partition))?;
        match (response.status, response.reply) {
            (Status::Ok, Reply::Listing(listing)) => Ok(listing),
            (Status::Ok, other) => Err(RpcError::UnexpectedReply(format!("{:?}", other))),
            (status, _) => Err(RpcError::Status(status)),
        }
    }

    /// List every partition of `dir`
    ///
    /// Each reply carries the server's map, so partitions created while the
    /// listing runs are picked up. An entry moved by a concurrent split may
    /// be seen twice; names are deduplicated.
    pub fn readdir(&self, dir: DirRef) -> RpcResult<Vec<DirectoryListing>> {
        let mut visited = BTreeSet::new();
        let mut entries = BTreeMap::new();

        loop {
            let mapping = self.cached_mapping(dir)?;
            let pending: Vec<_> = mapping.partitions().filter(|p| !visited.contains(p)).collect();
            if pending.is_empty() {
                break;
            }
            for partition in pending {
                for listing in self.readdir_partition(dir, partition)? {
                    entries.entry(listing.name.clone()).or_insert(listing);
                }
                visited.insert(partition);
            }
        }

        tracing::debug!(
            "Listed directory {}: {} entries in {} partitions",
            dir.id,
            entries.len(),
            visited.len()
        );
        Ok(entries.into_values().collect())
    }

    /// Tell every server holding a partition of `dir` to drop its map
    pub fn drop_directory(&self, dir: DirRef) -> RpcResult<()> {
        let mapping = self.get_partition_map(dir)?;
        let servers: BTreeSet<_> = mapping
            .partitions()
            .map(|p| mapping.server_for_index(p))
            .collect();

        let request = Request::DropDirectory { dir: dir.id };
        for server in servers {
            match self.transport.call(server, &request, self.policy.rpc_timeout) {
                Ok(resp) if resp.status.is_ok() => {}
                Ok(resp) => {
                    tracing::warn!(
                        "Server {} refused to drop directory {}: {:?}",
                        server,
                        dir.id,
                        resp.status
                    );
                }
                Err(e) => {
                    tracing::warn!("Failed to drop directory {} on server {}: {}", dir.id, server, e);
                }
            }
        }
        self.forget_directory(dir);
        Ok(())
    }
}
