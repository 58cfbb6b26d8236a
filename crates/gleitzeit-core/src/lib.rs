//! # Gleitzeit Core
//!
//! Shared data model for the Gleitzeit workflow-execution platform:
//! tasks, workflows, results, retry policies, protocol specifications,
//! the provider invocation contract, and declarative workflow documents.
//!
//! Workflows are DAGs of typed tasks. Each task names a protocol and a
//! method; the engine routes it to a provider implementing that protocol,
//! honoring dependencies, retries, and `${task.path}` parameter
//! substitution between tasks.

pub mod document;
pub mod error;
pub mod invocation;
pub mod protocol;
pub mod task;
pub mod workflow;

// Re-export commonly used types
pub use document::{RetryDocument, TaskDocument, WorkflowDocument};
pub use error::{error_codes, CoreError, CoreResult, ErrorKind};
pub use invocation::{InvocationError, InvocationRequest, InvocationResponse};
pub use protocol::{MethodSpec, ProtocolSpec, ProviderHealth};
pub use task::{
    Priority, ProtocolId, ProviderId, RetryConfig, Task, TaskId, TaskRef, TaskRequirements,
    TaskResult, TaskStatus, WorkflowId,
};
pub use workflow::{ErrorStrategy, Workflow, WorkflowStatus, WorkflowSummary};
