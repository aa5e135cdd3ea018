//! ShardFS server configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CachePolicy;
use crate::metadata::ServerId;
use crate::rpc::server_list::read_server_list;

/// Default configuration constants
///
/// This module centralizes all default values used throughout ShardFS.
pub mod defaults {
    // Split defaults
    /// Entries per partition before it splits
    pub const SPLIT_THRESHOLD: u64 = 2000;

    /// Deadline for shipping a split child to its server
    pub const SPLIT_PLACE_TIMEOUT_SECS: u64 = 30;

    // Network defaults
    /// Per-RPC timeout: 10 seconds
    pub const TIMEOUT_SECS: u64 = 10;

    /// Attempts per client operation before giving up
    pub const MAX_RETRIES: u32 = 16;

    /// First backoff step after a transport error or a Retry reply
    pub const RETRY_BACKOFF_MS: u64 = 5;

    /// Backoff ceiling
    pub const MAX_BACKOFF_MS: u64 = 1000;

    /// Default listen address
    pub const fn default_bind_addr() -> &'static str {
        "0.0.0.0:7400"
    }

    // Cache defaults
    /// Directory cache entries per server
    pub const DIRECTORY_CACHE_ENTRIES: usize = 4096;

    /// Directory cache shards
    pub const DIRECTORY_CACHE_SHARDS: usize = 16;

    /// Client name cache entries
    pub const NAME_CACHE_ENTRIES: usize = 10_000;

    /// Client name cache TTL in seconds (0 = no TTL)
    pub const NAME_CACHE_TTL_SECS: u64 = 5;

    // Log level
    /// Default log level
    pub const fn default_log_level() -> &'static str {
        "info"
    }
}

/// ShardFS server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server node configuration
    pub node: NodeConfig,

    /// Cluster membership
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Directory splitting
    #[serde(default)]
    pub split: SplitConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This server's index in the cluster (0-based)
    pub server_id: ServerId,

    /// Directory for metadata snapshots (none = memory only)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    defaults::default_log_level().to_string()
}

/// Cluster membership
///
/// Servers are listed in id order, either inline or in a server list file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Server addresses, index = server id
    #[serde(default)]
    pub servers: Vec<String>,

    /// Server list file (`node_<id> ip:port` lines)
    #[serde(default)]
    pub server_list: Option<PathBuf>,
}

/// Split configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    /// Entries per partition before it splits
    #[serde(default = "default_split_threshold")]
    pub threshold: u64,

    /// Deadline for placing a split child on a remote server
    #[serde(default = "default_place_timeout")]
    pub place_timeout_secs: u64,
}

fn default_split_threshold() -> u64 {
    defaults::SPLIT_THRESHOLD
}

fn default_place_timeout() -> u64 {
    defaults::SPLIT_PLACE_TIMEOUT_SECS
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            threshold: default_split_threshold(),
            place_timeout_secs: default_place_timeout(),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Server address to bind (IP:port)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Per-RPC timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Attempts per client operation
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff step in milliseconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_bind_addr() -> String {
    defaults::default_bind_addr().to_string()
}

fn default_timeout() -> u64 {
    defaults::TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    defaults::MAX_RETRIES
}

fn default_retry_backoff() -> u64 {
    defaults::RETRY_BACKOFF_MS
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_directory_cache_entries")]
    pub directory_cache_entries: usize,

    #[serde(default = "default_directory_cache_shards")]
    pub directory_cache_shards: usize,

    #[serde(default = "default_name_cache_entries")]
    pub name_cache_entries: usize,

    /// Name cache TTL in seconds (0 = no TTL)
    #[serde(default = "default_name_cache_ttl")]
    pub name_cache_ttl_secs: u64,
}

fn default_directory_cache_entries() -> usize {
    defaults::DIRECTORY_CACHE_ENTRIES
}

fn default_directory_cache_shards() -> usize {
    defaults::DIRECTORY_CACHE_SHARDS
}

fn default_name_cache_entries() -> usize {
    defaults::NAME_CACHE_ENTRIES
}

fn default_name_cache_ttl() -> u64 {
    defaults::NAME_CACHE_TTL_SECS
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory_cache_entries: default_directory_cache_entries(),
            directory_cache_shards: default_directory_cache_shards(),
            name_cache_entries: default_name_cache_entries(),
            name_cache_ttl_secs: default_name_cache_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn directory_policy(&self) -> CachePolicy {
        CachePolicy::lru(self.directory_cache_entries).with_shards(self.directory_cache_shards)
    }

    pub fn name_policy(&self) -> CachePolicy {
        match self.name_cache_ttl_secs {
            0 => CachePolicy::lru(self.name_cache_entries),
            ttl => CachePolicy::lru_with_ttl(self.name_cache_entries, Duration::from_secs(ttl)),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                server_id: 0,
                data_dir: None,
                log_level: default_log_level(),
            },
            cluster: ClusterConfig {
                servers: vec!["127.0.0.1:7400".to_string()],
                server_list: None,
            },
            split: SplitConfig::default(),
            network: NetworkConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(format!("Failed to read config file: {}", e)))?;

        let config: ServerConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(|e| {
            ConfigError::SerializeError(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), contents)
            .map_err(|e| ConfigError::WriteError(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Resolve cluster addresses, index = server id
    ///
    /// A server list file takes precedence over inline addresses.
    pub fn server_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        if let Some(path) = &self.cluster.server_list {
            let servers = read_server_list(path)
                .map_err(|e| ConfigError::ReadError(format!("Failed to read server list: {}", e)))?;
            let mut addrs = Vec::with_capacity(servers.len());
            for (expected, info) in servers.iter().enumerate() {
                if info.server_id as usize != expected {
                    return Err(ConfigError::ValidationError(format!(
                        "Server list must list ids in order: expected {}, found {}",
                        expected, info.node_id
                    )));
                }
                addrs.push(info.socket_addr);
            }
            return Ok(addrs);
        }

        self.cluster
            .servers
            .iter()
            .map(|s| {
                s.parse::<SocketAddr>().map_err(|e| {
                    ConfigError::ValidationError(format!("Invalid server address '{}': {}", s, e))
                })
            })
            .collect()
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.network.timeout_secs)
    }

    pub fn place_timeout(&self) -> Duration {
        Duration::from_secs(self.split.place_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate log level
        match self.node.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.node.log_level
                )));
            }
        }

        if self.split.threshold == 0 {
            return Err(ConfigError::ValidationError(
                "Split threshold must be greater than zero".to_string(),
            ));
        }

        if self.network.timeout_secs == 0 || self.network.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "Timeout and retry count must be greater than zero".to_string(),
            ));
        }

        if self.cache.directory_cache_entries == 0 {
            return Err(ConfigError::ValidationError(
                "Directory cache must hold at least one entry".to_string(),
            ));
        }

        // Inline server lists must contain this node
        if self.cluster.server_list.is_none() {
            if self.cluster.servers.is_empty() {
                return Err(ConfigError::ValidationError(
                    "Cluster must list at least one server".to_string(),
                ));
            }
            if self.node.server_id as usize >= self.cluster.servers.len() {
                return Err(ConfigError::ValidationError(format!(
                    "Server id {} is outside the cluster of {}",
                    self.node.server_id,
                    self.cluster.servers.len()
                )));
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
