//! # Gleitzeit Storage
//!
//! The persistence port of the Gleitzeit platform: a backend-agnostic
//! contract for durable workflow, task, and result state, plus the two
//! bundled backends (in-memory and JSON-on-disk).
//!
//! The engine drives every backend through [`StorageBackend`]. Operations
//! are atomic with respect to concurrent callers within one process,
//! writes are durable before they are acknowledged, and reads reflect the
//! latest acknowledged write from the same process. Queue state is not a
//! separate table: task status rows (`queued` / `reserved`) are sufficient
//! to rebuild the queue after a restart.

pub mod backend;
pub mod error;

pub use backend::disk::{DiskStorage, DiskStorageConfig};
pub use backend::memory::MemoryStorage;
pub use backend::{StatusUpdate, StorageBackend, WorkflowPage};
pub use error::{StorageError, StorageResult};
