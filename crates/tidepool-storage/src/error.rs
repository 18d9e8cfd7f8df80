//! Storage error type

use tidepool_common::{DataLocation, Error, PartitionId};

/// Error type for storage engine operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("partition {partition} is not present in {location}")]
    PartitionMissing {
        location: DataLocation,
        partition: PartitionId,
    },
    #[error("engine for {0} is closed")]
    Closed(DataLocation),
}

impl From<redb::TransactionError> for StorageError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(e) => Self::Io(e),
            StorageError::Bincode(e) => Self::corrupt(e.to_string()),
            other => Self::storage(other.to_string()),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
