//! Upload error types.

use chunkup_transfer::TransferError;

use crate::transport::TransportError;

/// Errors produced while driving an upload task.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("empty files are not supported")]
    EmptyFileNotSupported,

    #[error("hashing failed: {0}")]
    HashingFailed(String),

    #[error("transient network error: {0}")]
    Transient(String),

    #[error("server rejected request ({code}): {message}")]
    Protocol { code: i32, message: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("chunk {index} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        index: u32,
        attempts: u32,
        last_error: String,
    },

    #[error("merge failed: {0}")]
    MergeFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task cannot be retried: {0}")]
    NotRetryable(String),
}

impl From<TransportError> for UploadError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Transient(msg) => Self::Transient(msg),
            TransportError::Protocol { code, message } => Self::Protocol { code, message },
            TransportError::Unauthorized => Self::Unauthorized,
        }
    }
}

impl From<TransferError> for UploadError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::EmptyFile => Self::EmptyFileNotSupported,
            TransferError::InvalidChunkSize(size) => {
                Self::Configuration(format!("chunk size must be positive, got {size}"))
            }
            e @ TransferError::TooManyChunks(_) => Self::Configuration(e.to_string()),
            other => Self::HashingFailed(other.to_string()),
        }
    }
}
