//! # Gleitzeit Engine
//!
//! The orchestration core of the Gleitzeit workflow platform.
//!
//! Workflows enter through [`ExecutionEngine::submit_workflow`], which
//! validates the DAG, persists it, and enqueues initially-ready tasks. A
//! pool of worker loops reserves tasks from the priority queue, resolves
//! `${task.path}` parameter substitutions against prior results, selects
//! a provider through the registry, and invokes it under a deadline. A
//! single event loop owns every state transition: it applies worker
//! outcomes (ack, persist result, release dependents) and timer events
//! (retry backoff, timeouts, visibility expiry, health probes), so task
//! state advances monotonically no matter how many workers run.
//!
//! Durable state lives behind the storage port; on restart the engine
//! rebuilds its queue and dependency state from task status rows, giving
//! at-least-once dispatch with at-most-once successful completion.

pub mod engine;
pub mod error;
pub mod events;
pub mod resolver;
pub mod substitution;
pub mod timer;

pub use engine::{EngineConfig, ExecutionEngine, TaskStatusEntry, WorkflowStatusReport};
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventBus, Subscription};
pub use resolver::DependencyResolver;
pub use timer::{TimerEvent, TimerEventId, TimerService};
