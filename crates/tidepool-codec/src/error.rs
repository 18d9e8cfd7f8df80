//! Codec error type

use tidepool_common::Error;

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("decompressed value exceeds {max} bytes")]
    TooLarge { max: usize },
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::corrupt(e.to_string())
    }
}

pub type CodecResult<T> = Result<T, CodecError>;
