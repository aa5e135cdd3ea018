//! ShardFS - a distributed metadata service with incremental directory splitting
//!
//! Every directory starts as a single partition on its zeroth server. When a
//! partition grows past a size threshold the server that holds it splits it
//! in two, moving the entries whose name hash falls in the new child's range
//! to the child's server. Clients and servers route each name by resolving
//! it against a per-directory partition map; a request that lands on the
//! wrong server is refused with the server's newer map, and the client
//! retries. No split is ever broadcast.
//!
//! # Architecture
//!
//! - **Metadata** ([`metadata`]): partition maps, name resolution, entry records
//! - **Cache** ([`cache`]): pinned directory cache and the client name cache
//! - **Storage** ([`storage`]): the metadata store trait and its in-memory implementation
//! - **Split** ([`split`]): split task queue and the split coordinator
//! - **RPC** ([`rpc`]): wire protocol, transports, server handlers and the retrying client
//! - **Server** ([`server`]): server node lifecycle and signal handling
//! - **API** ([`api`]): POSIX-like operations over absolute paths
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shardfs::api::ShardFs;
//! use shardfs::rpc::client::RetryPolicy;
//! use shardfs::rpc::LocalTransport;
//! use shardfs::server::{NodeOptions, ServerNode};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(LocalTransport::new(2));
//! let nodes = (0..2)
//!     .map(|id| ServerNode::start(NodeOptions::new(id, 2), transport.clone()))
//!     .collect::<Result<Vec<_>, _>>()?;
//! for node in &nodes {
//!     transport.register(node.server_id(), &node.handler());
//! }
//!
//! let fs = ShardFs::new(transport, RetryPolicy::default());
//! fs.mkdir("/data", 0o755)?;
//! fs.create("/data/a.txt", 0o644)?;
//! fs.write("/data/a.txt", 0, b"hello")?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod constants;
pub mod logging;
pub mod metadata;
pub mod rpc;
pub mod server;
pub mod split;
pub mod storage;
