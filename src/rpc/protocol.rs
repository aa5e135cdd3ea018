//! Wire messages exchanged between clients and metadata servers
//!
//! Every directory-scoped request names the directory by [`DirRef`] so a
//! server that has never seen the directory knows where to fetch its map.
//! Every reply carries a [`Status`]; routing statuses come with the replying
//! server's current map attached.

use serde::{Deserialize, Serialize};

use crate::metadata::{
    DirRef, DirectoryId, DirectoryListing, EntryAttr, PartitionIndex, PartitionMap,
};
use crate::storage::{SequenceRange, TransportUnit};

/// RPC operation tag, used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetAttr,
    Lookup,
    MkDir,
    MkNod,
    ReadDir,
    Write,
    Read,
    Remove,
    Chmod,
    GetPartitionMap,
    Split,
    CommitSplit,
    AbortSplit,
    DropDirectory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    GetAttr {
        dir: DirRef,
        name: String,
    },
    Lookup {
        dir: DirRef,
        name: String,
    },
    MkDir {
        dir: DirRef,
        name: String,
        mode: u32,
    },
    MkNod {
        dir: DirRef,
        name: String,
        mode: u32,
    },
    /// List one partition of a directory
    ReadDir {
        dir: DirRef,
        partition: PartitionIndex,
    },
    Write {
        dir: DirRef,
        name: String,
        offset: u64,
        data: Vec<u8>,
    },
    Read {
        dir: DirRef,
        name: String,
        offset: u64,
        length: u64,
    },
    Remove {
        dir: DirRef,
        name: String,
    },
    Chmod {
        dir: DirRef,
        name: String,
        mode: u32,
    },
    GetPartitionMap {
        dir: DirRef,
    },
    /// Inter-server: stage a split child
    ///
    /// The receiver bulk-loads the unit but keeps serving its old map until
    /// `CommitSplit` arrives. `mapping` is only used to check the addressee.
    Split {
        dir: DirectoryId,
        parent: PartitionIndex,
        child: PartitionIndex,
        unit: TransportUnit,
        range: SequenceRange,
        count: u64,
        mapping: PartitionMap,
    },
    /// Inter-server: the parent published the split; adopt `mapping`
    CommitSplit {
        dir: DirectoryId,
        parent: PartitionIndex,
        child: PartitionIndex,
        mapping: PartitionMap,
    },
    /// Inter-server: the parent gave up; drop the staged child
    AbortSplit {
        dir: DirectoryId,
        child: PartitionIndex,
    },
    /// Forget a removed directory's map
    DropDirectory {
        dir: DirectoryId,
    },
}

impl Request {
    pub fn operation(&self) -> Operation {
        match self {
            Request::GetAttr { .. } => Operation::GetAttr,
            Request::Lookup { .. } => Operation::Lookup,
            Request::MkDir { .. } => Operation::MkDir,
            Request::MkNod { .. } => Operation::MkNod,
            Request::ReadDir { .. } => Operation::ReadDir,
            Request::Write { .. } => Operation::Write,
            Request::Read { .. } => Operation::Read,
            Request::Remove { .. } => Operation::Remove,
            Request::Chmod { .. } => Operation::Chmod,
            Request::GetPartitionMap { .. } => Operation::GetPartitionMap,
            Request::Split { .. } => Operation::Split,
            Request::CommitSplit { .. } => Operation::CommitSplit,
            Request::AbortSplit { .. } => Operation::AbortSplit,
            Request::DropDirectory { .. } => Operation::DropDirectory,
        }
    }

    /// Directory and entry name the request is routed by, if any
    pub fn routing_key(&self) -> Option<(DirRef, &str)> {
        match self {
            Request::GetAttr { dir, name }
            | Request::Lookup { dir, name }
            | Request::MkDir { dir, name, .. }
            | Request::MkNod { dir, name, .. }
            | Request::Write { dir, name, .. }
            | Request::Read { dir, name, .. }
            | Request::Remove { dir, name }
            | Request::Chmod { dir, name, .. } => Some((*dir, name.as_str())),
            _ => None,
        }
    }

    /// Whether the request changes an entry
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Request::MkDir { .. }
                | Request::MkNod { .. }
                | Request::Write { .. }
                | Request::Remove { .. }
                | Request::Chmod { .. }
        )
    }
}

/// Reply status
///
/// `StaleMapping` and `Retry` are routing statuses and never reach the
/// application; everything else maps to a POSIX error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    /// Request landed on the wrong server; see attached map
    StaleMapping,
    /// Target range is being split; back off and retry
    Retry,
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    NotEmpty,
    InvalidArgument,
    /// Server has no map for the directory and could not fetch one
    DirectoryUnknown,
    IoError,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        *self == Status::Ok
    }

    pub fn is_routing(&self) -> bool {
        matches!(self, Status::StaleMapping | Status::Retry)
    }

    /// Negative POSIX error code (0 for success)
    pub fn to_errno(&self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::NotFound => -libc::ENOENT,
            Status::AlreadyExists => -libc::EEXIST,
            Status::NotADirectory => -libc::ENOTDIR,
            Status::IsADirectory => -libc::EISDIR,
            Status::NotEmpty => -libc::ENOTEMPTY,
            Status::InvalidArgument => -libc::EINVAL,
            Status::Retry => -libc::EAGAIN,
            Status::StaleMapping | Status::DirectoryUnknown | Status::IoError => -libc::EIO,
        }
    }
}

/// Reply payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Empty,
    Attr(EntryAttr),
    Listing(Vec<DirectoryListing>),
    Data(Vec<u8>),
    Written(u64),
    Mapping(PartitionMap),
    Loaded(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    /// Replying server's map for the directory
    pub mapping: Option<PartitionMap>,
    pub reply: Reply,
}

impl Response {
    pub fn ok(reply: Reply) -> Self {
        Self {
            status: Status::Ok,
            mapping: None,
            reply,
        }
    }

    pub fn error(status: Status) -> Self {
        Self {
            status,
            mapping: None,
            reply: Reply::Empty,
        }
    }

    pub fn stale(mapping: PartitionMap) -> Self {
        Self {
            status: Status::StaleMapping,
            mapping: Some(mapping),
            reply: Reply::Empty,
        }
    }

    pub fn retry(mapping: PartitionMap) -> Self {
        Self {
            status: Status::Retry,
            mapping: Some(mapping),
            reply: Reply::Empty,
        }
    }

    pub fn with_mapping(mut self, mapping: PartitionMap) -> Self {
        self.mapping = Some(mapping);
        self
    }
}
