//! Error types for the execution engine.

use gleitzeit_core::{CoreError, ErrorKind};
use gleitzeit_queue::QueueError;
use gleitzeit_registry::RegistryError;
use gleitzeit_storage::StorageError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the execution engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Data-model or document error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Persistence failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Queue failure.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Referenced workflow or task is unknown.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Engine is not running.
    #[error("Engine is not running")]
    NotRunning,

    /// A wait deadline elapsed.
    #[error("Timed out waiting for {0}")]
    WaitTimeout(String),
}

impl EngineError {
    /// Classification used by callers (CLI exit codes, retry decisions).
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Core(err) => err.kind(),
            EngineError::Storage(err) => err.kind(),
            EngineError::Queue(err) => err.kind(),
            EngineError::Registry(err) => err.kind(),
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::NotRunning => ErrorKind::Internal,
            EngineError::WaitTimeout(_) => ErrorKind::Timeout,
        }
    }
}
