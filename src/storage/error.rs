use thiserror::Error;

use crate::metadata::{DirectoryId, PartitionIndex};

/// ストレージエラー
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists: {0}")]
    AlreadyExists(String),

    #[error("Partition {child} is not a child of partition {parent}")]
    NotAChild {
        parent: PartitionIndex,
        child: PartitionIndex,
    },

    #[error("Transport unit for directory {directory} partition {partition} is outside sequence range {start}..{end}")]
    SequenceOutOfRange {
        directory: DirectoryId,
        partition: PartitionIndex,
        start: u64,
        end: u64,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
