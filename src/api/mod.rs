//! ShardFS filesystem API
//!
//! POSIX-like operations over absolute paths, built on the metadata RPC
//! client.
pub mod file_ops;
pub mod types;

pub use file_ops::ShardFs;
pub use types::{path_components, split_parent, ApiError, ApiResult};
