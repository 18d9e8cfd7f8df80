//! Error types for Tidepool
//!
//! This module defines the common error type shared by the metadata cache,
//! the version reference machinery, and the read path.

use thiserror::Error;

/// Common result type for Tidepool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Tidepool
#[derive(Debug, Error)]
pub enum Error {
    // Metadata errors
    /// A notification arrived for an unexpected path or identity
    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("store not found: {0}")]
    StoreNotFound(String),

    #[error("reads are disabled for store: {0}")]
    ReadDisabled(String),

    #[error("coordination error: {0}")]
    Coordination(String),

    // Version errors
    /// Nothing is installed in a version reference yet
    #[error("no payload installed: {0}")]
    NotReady(String),

    #[error("no ready version for store: {store}")]
    NoReadyVersion { store: String },

    // Lifecycle errors
    #[error("client is not started")]
    NotStarted,

    #[error("client is already started")]
    AlreadyStarted,

    #[error("failed to stop {failed} service(s); first failure in {service}: {source}")]
    Shutdown {
        service: String,
        failed: usize,
        #[source]
        source: Box<Error>,
    },

    // Read path errors
    #[error("partition {partition} of store {store} version {version} is not subscribed")]
    PartitionNotSubscribed {
        store: String,
        version: u32,
        partition: u32,
    },

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("schema resolution error: {0}")]
    SchemaResolution(String),

    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a consistency error
    pub fn consistency(msg: impl Into<String>) -> Self {
        Self::Consistency(msg.into())
    }

    /// Create a coordination error
    pub fn coordination(msg: impl Into<String>) -> Self {
        Self::Coordination(msg.into())
    }

    /// Create a corrupt data error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptData(msg.into())
    }

    /// Create a schema resolution error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::SchemaResolution(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if the caller may retry the same operation later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotReady(_) | Self::NoReadyVersion { .. } | Self::Coordination(_)
        )
    }

    /// Check if the error was caused by how the client was used
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::NotStarted
                | Self::AlreadyStarted
                | Self::PartitionNotSubscribed { .. }
                | Self::InvalidArgument(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::StoreNotFound(_) | Self::NoReadyVersion { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Self::Io(e.into())
        } else {
            Self::Deserialization(e.to_string())
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::NotReady("store".into()).is_retryable());
        assert!(
            Error::NoReadyVersion {
                store: "s".into()
            }
            .is_retryable()
        );
        assert!(!Error::corrupt("bad gzip").is_retryable());
        assert!(!Error::NotStarted.is_retryable());
    }

    #[test]
    fn test_error_caller() {
        assert!(Error::NotStarted.is_caller_error());
        assert!(
            Error::PartitionNotSubscribed {
                store: "s".into(),
                version: 1,
                partition: 3
            }
            .is_caller_error()
        );
        assert!(!Error::consistency("path").is_caller_error());
    }

    #[test]
    fn test_shutdown_display() {
        let err = Error::Shutdown {
            service: "storage".into(),
            failed: 2,
            source: Box::new(Error::storage("disk gone")),
        };
        let msg = err.to_string();
        assert!(msg.contains("2 service(s)"));
        assert!(msg.contains("storage"));
    }
}
