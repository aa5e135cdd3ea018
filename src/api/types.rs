//! API types for path-level ShardFS operations

use crate::constants::{is_valid_name, MAX_PATH_LENGTH};
use crate::rpc::{RpcError, Status};

/// API errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("File already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Gave up on {path} after {attempts} attempts")]
    RetryExhausted { path: String, attempts: u32 },

    #[error("RPC error on {path}: {source}")]
    Rpc { path: String, source: RpcError },
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Attach `path` to an RPC failure
    pub fn from_rpc(path: &str, err: RpcError) -> Self {
        let path = path.to_string();
        match err {
            RpcError::Status(status) => match status {
                Status::NotFound => ApiError::NotFound(path),
                Status::AlreadyExists => ApiError::AlreadyExists(path),
                Status::NotADirectory => ApiError::NotADirectory(path),
                Status::IsADirectory => ApiError::IsADirectory(path),
                Status::NotEmpty => ApiError::NotEmpty(path),
                Status::InvalidArgument => ApiError::InvalidArgument(path),
                _ => ApiError::Rpc {
                    path,
                    source: RpcError::Status(status),
                },
            },
            RpcError::RetryExhausted { attempts } => ApiError::RetryExhausted { path, attempts },
            source => ApiError::Rpc { path, source },
        }
    }

    /// Negative POSIX error code
    pub fn to_errno(&self) -> i32 {
        match self {
            ApiError::NotFound(_) => -libc::ENOENT,
            ApiError::InvalidArgument(_) => -libc::EINVAL,
            ApiError::AlreadyExists(_) => -libc::EEXIST,
            ApiError::NotADirectory(_) => -libc::ENOTDIR,
            ApiError::IsADirectory(_) => -libc::EISDIR,
            ApiError::NotEmpty(_) => -libc::ENOTEMPTY,
            ApiError::RetryExhausted { .. } => -libc::ETIMEDOUT,
            ApiError::Rpc { source, .. } => source.to_errno(),
        }
    }
}

/// Split an absolute path into its components
///
/// `"/"` yields no components. Empty components (`//`) are skipped.
pub fn path_components(path: &str) -> ApiResult<Vec<&str>> {
    if !path.starts_with('/') || path.len() > MAX_PATH_LENGTH {
        return Err(ApiError::InvalidArgument(path.to_string()));
    }
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.iter().any(|c| !is_valid_name(c)) {
        return Err(ApiError::InvalidArgument(path.to_string()));
    }
    Ok(components)
}

/// Split an absolute path into its parent components and final name
pub fn split_parent(path: &str) -> ApiResult<(Vec<&str>, &str)> {
    let mut components = path_components(path)?;
    match components.pop() {
        Some(name) => Ok((components, name)),
        None => Err(ApiError::InvalidArgument(path.to_string())),
    }
}
