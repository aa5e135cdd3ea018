use std::time::Duration;

use crate::metadata::ServerId;

pub mod protocol;
pub mod transport;
pub mod tcp;
pub mod handlers;
pub mod client;
pub mod server_list;

pub use protocol::{Operation, Reply, Request, Response, Status};
pub use transport::{LocalTransport, RpcHandler, Transport};

/// RPC error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("RPC to server {server} timed out after {timeout:?}")]
    Timeout { server: ServerId, timeout: Duration },

    #[error("Server {0} is unreachable")]
    Unreachable(ServerId),

    #[error("Unknown server {0}")]
    UnknownServer(ServerId),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Server replied {0:?}")]
    Status(Status),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Gave up after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
}

impl RpcError {
    /// Transport failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::TransportError(_) | RpcError::Timeout { .. } | RpcError::Unreachable(_)
        )
    }

    /// Negative POSIX error code
    pub fn to_errno(&self) -> i32 {
        match self {
            RpcError::Status(status) => status.to_errno(),
            RpcError::Timeout { .. } | RpcError::RetryExhausted { .. } => -libc::ETIMEDOUT,
            RpcError::Unreachable(_) => -libc::EHOSTUNREACH,
            _ => -libc::EIO,
        }
    }
}

impl From<bincode::Error> for RpcError {
    fn from(e: bincode::Error) -> Self {
        RpcError::InvalidFrame(e.to_string())
    }
}

pub type RpcResult<T> = Result<T, RpcError>;
