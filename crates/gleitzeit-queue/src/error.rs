//! Error types for the task queue.

use gleitzeit_core::ErrorKind;
use thiserror::Error;

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors produced by the task queue.
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// Global queue depth reached the configured cap.
    #[error("Queue is full (depth {depth} >= cap {cap})")]
    Backpressure { depth: usize, cap: usize },

    /// Operation referenced a task that is not reserved.
    #[error("Task {0} is not reserved")]
    NotReserved(String),
}

impl QueueError {
    /// Classification used by callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Backpressure { .. } => ErrorKind::Backpressure,
            QueueError::NotReserved(_) => ErrorKind::NotFound,
        }
    }
}
