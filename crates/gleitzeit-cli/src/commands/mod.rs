//! CLI subcommands.

pub mod cancel;
pub mod list;
pub mod providers;
pub mod prune;
pub mod results;
pub mod status;
pub mod submit;
pub mod validate;

use gleitzeit_engine::{EngineConfig, ExecutionEngine};
use gleitzeit_registry::{EchoProvider, ProviderHandle, ProviderRegistration};
use gleitzeit_storage::{DiskStorage, MemoryStorage, StorageBackend};
use std::path::PathBuf;
use std::sync::Arc;

/// Builds the storage backend selected on the command line.
pub fn storage_for(storage_dir: Option<PathBuf>) -> Arc<dyn StorageBackend> {
    match storage_dir {
        Some(dir) => Arc::new(DiskStorage::with_root(dir)),
        None => Arc::new(MemoryStorage::new()),
    }
}

/// Builds an unstarted engine over already-initialized storage, for
/// commands that only read or update persisted state. Starting the engine
/// would run recovery and re-execute interrupted tasks, which only
/// `submit` wants.
pub async fn engine_over(storage: Arc<dyn StorageBackend>) -> anyhow::Result<ExecutionEngine> {
    storage.initialize().await?;
    engine_for(storage)
}

/// Builds an engine over the given storage with the bundled echo provider
/// registered. Real deployments register their own providers here.
pub fn engine_for(storage: Arc<dyn StorageBackend>) -> anyhow::Result<ExecutionEngine> {
    let engine = ExecutionEngine::new(EngineConfig::default(), storage);
    let registry = engine.registry();
    registry.register_protocol(EchoProvider::protocol_spec())?;
    registry.register_provider(ProviderRegistration::new(
        "echo-provider-1",
        "echo/v1",
        ProviderHandle::Local(Arc::new(EchoProvider::new("echo-provider-1"))),
        EchoProvider::methods(),
    ))?;
    Ok(engine)
}
