//! Error types for storage backends.

use gleitzeit_core::ErrorKind;
use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors produced by storage backends.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Row not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Underlying I/O failure.
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be (de)serialized.
    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend used before `initialize` or after `shutdown`.
    #[error("Storage backend not initialized")]
    NotInitialized,

    /// Invalid status transition requested.
    #[error("Invalid status transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },
}

impl StorageError {
    /// Classification used by the retry policy. I/O faults are transient
    /// and mapped to `Transport`; the engine retries them.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::Io(_) => ErrorKind::Transport,
            StorageError::Serialization(_)
            | StorageError::NotInitialized
            | StorageError::InvalidTransition { .. } => ErrorKind::Internal,
        }
    }
}
