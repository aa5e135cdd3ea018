//! Path-level operations for ShardFS
//!
//! Paths are walked one component at a time from the root directory. Each
//! step is a `Lookup` routed by the component's name; results are kept in
//! the name cache so repeated walks stay local.

use std::sync::Arc;

use crate::api::types::{path_components, split_parent, ApiError, ApiResult};
use crate::cache::{CachePolicy, NameCache, NameCacheValue};
use crate::config::defaults;
use crate::metadata::{
    DirRef, DirectoryListing, EntryAttr, EntryRecord, InodeType, ROOT_DIRECTORY_ID,
    ROOT_ZEROTH_SERVER,
};
use crate::rpc::client::{RetryPolicy, RpcClient};
use crate::rpc::{RpcError, RpcResult, Status, Transport};

/// ShardFS filesystem client
pub struct ShardFs {
    client: RpcClient,
    names: NameCache,
}

impl ShardFs {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self::with_name_cache(
            transport,
            policy,
            CachePolicy::lru_with_ttl(
                defaults::NAME_CACHE_ENTRIES,
                std::time::Duration::from_secs(defaults::NAME_CACHE_TTL_SECS),
            ),
        )
    }

    pub fn with_name_cache(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        names: CachePolicy,
    ) -> Self {
        Self {
            client: RpcClient::new(transport, policy),
            names: NameCache::new(names),
        }
    }

    /// Underlying RPC client
    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub fn name_cache(&self) -> &NameCache {
        &self.names
    }

    /// 1コンポーネント分の解決
    fn lookup_component(&self, dir: DirRef, name: &str, use_cache: bool) -> RpcResult<NameCacheValue> {
        if use_cache {
            if let Some(hit) = self.names.get(dir.id, name) {
                return Ok(hit);
            }
        }
        let attr = self.client.lookup(dir, name)?;
        let value = NameCacheValue {
            inode: attr.inode,
            inode_type: attr.inode_type,
            zeroth_server: attr.zeroth_server,
        };
        self.names.put(dir.id, name, value);
        Ok(value)
    }

    /// Walk `components` from the root to a directory
    fn walk(&self, path: &str, components: &[&str], use_cache: bool) -> ApiResult<DirRef> {
        let mut dir = DirRef::root();
        for component in components {
            let value = self
                .lookup_component(dir, component, use_cache)
                .map_err(|e| ApiError::from_rpc(path, e))?;
            match (value.inode_type, value.zeroth_server) {
                (InodeType::Directory, Some(zeroth)) => dir = DirRef::new(value.inode, zeroth),
                _ => return Err(ApiError::NotADirectory(path.to_string())),
            }
        }
        Ok(dir)
    }

    /// Resolve the parent of `path` and run `op` on it
    ///
    /// A cached walk that ends in `NotFound` or an unknown directory is
    /// repeated once without the name cache.
    fn with_parent<T, F>(&self, path: &str, op: F) -> ApiResult<T>
    where
        F: Fn(DirRef, &str) -> RpcResult<T>,
    {
        let (parents, name) = split_parent(path)?;

        let cached = self
            .walk(path, &parents, true)
            .and_then(|dir| op(dir, name).map_err(|e| ApiError::from_rpc(path, e)));
        match cached {
            Err(ApiError::NotFound(_)) | Err(ApiError::NotADirectory(_)) | Err(ApiError::Rpc {
                source: RpcError::Status(Status::DirectoryUnknown),
                ..
            }) if !parents.is_empty() => {
                tracing::debug!("Retrying {} without the name cache", path);
                let dir = self.walk(path, &parents, false)?;
                op(dir, name).map_err(|e| ApiError::from_rpc(path, e))
            }
            other => other,
        }
    }

    /// Attributes of the root directory
    fn root_attr() -> EntryAttr {
        EntryRecord::directory(ROOT_DIRECTORY_ID, 0o755, ROOT_ZEROTH_SERVER).attr()
    }

    /// Create a directory
    pub fn mkdir(&self, path: &str, mode: u32) -> ApiResult<EntryAttr> {
        self.with_parent(path, |dir, name| self.client.mkdir(dir, name, mode))
    }

    /// Create a regular file
    pub fn create(&self, path: &str, mode: u32) -> ApiResult<EntryAttr> {
        self.with_parent(path, |dir, name| self.client.mknod(dir, name, mode))
    }

    pub fn stat(&self, path: &str) -> ApiResult<EntryAttr> {
        if path_components(path)?.is_empty() {
            return Ok(Self::root_attr());
        }
        self.with_parent(path, |dir, name| self.client.getattr(dir, name))
    }

    pub fn lookup(&self, path: &str) -> ApiResult<EntryAttr> {
        if path_components(path)?.is_empty() {
            return Ok(Self::root_attr());
        }
        self.with_parent(path, |dir, name| self.client.lookup(dir, name))
    }

    /// Resolve a directory path to its reference
    pub fn open_dir(&self, path: &str) -> ApiResult<DirRef> {
        let components = path_components(path)?;
        match self.walk(path, &components, true) {
            Err(ApiError::NotFound(_)) if !components.is_empty() => {
                self.walk(path, &components, false)
            }
            other => other,
        }
    }

    /// List a directory, sorted by name
    pub fn readdir(&self, path: &str) -> ApiResult<Vec<DirectoryListing>> {
        let dir = self.open_dir(path)?;
        self.client
            .readdir(dir)
            .map_err(|e| ApiError::from_rpc(path, e))
    }

    pub fn write(&self, path: &str, offset: u64, data: &[u8]) -> ApiResult<u64> {
        self.with_parent(path, |dir, name| self.client.write(dir, name, offset, data))
    }

    pub fn read(&self, path: &str, offset: u64, length: u64) -> ApiResult<Vec<u8>> {
        self.with_parent(path, |dir, name| self.client.read(dir, name, offset, length))
    }

    pub fn chmod(&self, path: &str, mode: u32) -> ApiResult<EntryAttr> {
        self.with_parent(path, |dir, name| self.client.chmod(dir, name, mode))
    }

    /// Remove a regular file
    pub fn unlink(&self, path: &str) -> ApiResult<()> {
        let attr = self.lookup(path)?;
        if attr.inode_type == InodeType::Directory {
            return Err(ApiError::IsADirectory(path.to_string()));
        }

        let (parents, name) = split_parent(path)?;
        let parent = self.walk(path, &parents, true)?;
        self.client
            .remove(parent, name)
            .map_err(|e| ApiError::from_rpc(path, e))?;
        self.names.invalidate(parent.id, name);
        Ok(())
    }

    /// Remove an empty directory
    ///
    /// Emptiness is checked with a listing first; a concurrent create in the
    /// directory can still slip in between the check and the removal.
    pub fn rmdir(&self, path: &str) -> ApiResult<()> {
        let (parents, name) = split_parent(path)?;
        let attr = self.lookup(path)?;
        let zeroth = match (attr.inode_type, attr.zeroth_server) {
            (InodeType::Directory, Some(zeroth)) => zeroth,
            _ => return Err(ApiError::NotADirectory(path.to_string())),
        };
        let target = DirRef::new(attr.inode, zeroth);

        let listing = self
            .client
            .readdir(target)
            .map_err(|e| ApiError::from_rpc(path, e))?;
        if !listing.is_empty() {
            return Err(ApiError::NotEmpty(path.to_string()));
        }

        let parent = self.walk(path, &parents, true)?;
        self.client
            .remove(parent, name)
            .map_err(|e| ApiError::from_rpc(path, e))?;
        self.names.invalidate(parent.id, name);
        self.names.invalidate_directory(target.id);

        if let Err(e) = self.client.drop_directory(target) {
            tracing::warn!("Removed {} but could not drop its maps: {}", path, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::LocalTransport;
    use crate::server::{NodeOptions, ServerNode};
    use std::time::Duration;

    fn cluster(count: u32) -> (Vec<ServerNode>, Arc<LocalTransport>, ShardFs) {
        let transport = Arc::new(LocalTransport::new(count));
        let nodes: Vec<ServerNode> = (0..count)
            .map(|id| ServerNode::start(NodeOptions::new(id, count), transport.clone()).unwrap())
            .collect();
        for node in &nodes {
            transport.register(node.server_id(), &node.handler());
        }
        let fs = ShardFs::new(transport.clone(), policy());
        (nodes, transport, fs)
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 8,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            rpc_timeout: Duration::from_secs(2),
            deadline: None,
        }
    }

    #[test]
    fn test_nested_paths() {
        let (_nodes, _transport, fs) = cluster(2);
        fs.mkdir("/a", 0o755).unwrap();
        fs.mkdir("/a/b", 0o755).unwrap();
        fs.create("/a/b/f", 0o644).unwrap();

        assert_eq!(fs.write("/a/b/f", 0, b"data").unwrap(), 4);
        assert_eq!(fs.read("/a/b/f", 0, 10).unwrap(), b"data");
        assert_eq!(fs.stat("/a/b/f").unwrap().size, 4);
        assert_eq!(fs.stat("/").unwrap().inode_type, InodeType::Directory);

        let names: Vec<_> = fs.readdir("/a").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["b"]);

        assert_eq!(
            fs.create("/a/b/f/g", 0o644).unwrap_err(),
            ApiError::NotADirectory("/a/b/f/g".to_string())
        );
        assert_eq!(
            fs.stat("/a/missing").unwrap_err(),
            ApiError::NotFound("/a/missing".to_string())
        );
    }

    #[test]
    fn test_unlink_and_rmdir() {
        let (_nodes, _transport, fs) = cluster(2);
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/d/f", 0o644).unwrap();

        assert_eq!(fs.rmdir("/d").unwrap_err(), ApiError::NotEmpty("/d".to_string()));
        assert_eq!(fs.unlink("/d").unwrap_err(), ApiError::IsADirectory("/d".to_string()));

        fs.unlink("/d/f").unwrap();
        fs.rmdir("/d").unwrap();
        assert!(matches!(fs.stat("/d"), Err(ApiError::NotFound(_))));
        assert!(fs.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn test_chmod_and_errno() {
        let (_nodes, _transport, fs) = cluster(1);
        fs.create("/f", 0o644).unwrap();
        assert_eq!(fs.chmod("/f", 0o600).unwrap().permissions.mode, 0o600);

        let err = fs.create("/f", 0o644).unwrap_err();
        assert_eq!(err.to_errno(), -libc::EEXIST);
        assert_eq!(fs.mkdir("/", 0o755).unwrap_err().to_errno(), -libc::EINVAL);
    }

    #[test]
    fn test_stale_name_cache_falls_back() {
        let (_nodes, transport, fs) = cluster(2);
        fs.mkdir("/d", 0o755).unwrap();
        fs.create("/d/f", 0o644).unwrap();

        // 別クライアントが作り直すとキャッシュされた inode は古くなる
        let other = ShardFs::new(transport, policy());
        other.unlink("/d/f").unwrap();
        other.rmdir("/d").unwrap();
        other.mkdir("/d", 0o755).unwrap();
        other.create("/d/f", 0o644).unwrap();

        assert!(fs.stat("/d/f").is_ok());
    }
}
