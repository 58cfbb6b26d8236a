//! Storage backend contract and implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gleitzeit_core::{
    Task, TaskId, TaskRef, TaskResult, TaskStatus, Workflow, WorkflowSummary,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::StorageResult;

pub mod disk;
pub mod memory;

/// Timestamp and attempt fields carried by an atomic status update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// New `started_at` value, if the transition stamps one.
    pub started_at: Option<DateTime<Utc>>,

    /// New `completed_at` value, if the transition stamps one.
    pub completed_at: Option<DateTime<Utc>>,

    /// New attempt counter, if the transition advances it.
    pub attempt: Option<u32>,
}

impl StatusUpdate {
    /// An update that only changes the status.
    pub fn none() -> Self {
        Self::default()
    }

    /// Update for a task entering `executing` now.
    pub fn started(attempt: u32) -> Self {
        Self {
            started_at: Some(Utc::now()),
            completed_at: None,
            attempt: Some(attempt),
        }
    }

    /// Update for a task reaching a terminal status now.
    pub fn finished() -> Self {
        Self {
            started_at: None,
            completed_at: Some(Utc::now()),
            attempt: None,
        }
    }
}

/// One page of a workflow listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPage {
    /// Workflow summaries, ordered by id.
    pub workflows: Vec<WorkflowSummary>,

    /// Cursor for the next page; `None` when exhausted.
    pub next_cursor: Option<String>,
}

/// Abstract durable store consumed by the engine.
///
/// The same contract must be satisfied by any backing implementation; the
/// engine tolerates transient failures and retries.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Opens resources. Idempotent.
    async fn initialize(&self) -> StorageResult<()>;

    /// Flushes and closes resources.
    async fn shutdown(&self) -> StorageResult<()>;

    /// Upserts a workflow row (definition and current status).
    async fn save_workflow(&self, workflow: &Workflow) -> StorageResult<()>;

    /// Looks up a workflow by id.
    async fn get_workflow(&self, id: &str) -> StorageResult<Option<Workflow>>;

    /// Pages through workflow summaries, ordered by id. `cursor` is the
    /// last id of the previous page.
    async fn list_workflows(
        &self,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<WorkflowPage>;

    /// Upserts a task row.
    async fn save_task(&self, task: &Task) -> StorageResult<()>;

    /// Looks up a task row.
    async fn get_task(&self, task: &TaskRef) -> StorageResult<Option<Task>>;

    /// Returns every task row with the given status, across workflows.
    async fn get_tasks_by_status(&self, status: TaskStatus) -> StorageResult<Vec<Task>>;

    /// Returns every task row of one workflow.
    async fn get_tasks_by_workflow(&self, workflow_id: &str) -> StorageResult<Vec<Task>>;

    /// Atomically updates a task row's status, timestamps, and attempt.
    /// Fails when the row is missing or the transition is invalid.
    async fn update_task_status(
        &self,
        task: &TaskRef,
        status: TaskStatus,
        update: StatusUpdate,
    ) -> StorageResult<()>;

    /// Upserts a task result row. A result for a `completed` task is never
    /// overwritten.
    async fn save_task_result(&self, result: &TaskResult) -> StorageResult<()>;

    /// Looks up the result of one task.
    async fn get_task_result(&self, task: &TaskRef) -> StorageResult<Option<TaskResult>>;

    /// Returns all results of one workflow, keyed by task id.
    async fn get_workflow_results(
        &self,
        workflow_id: &str,
    ) -> StorageResult<HashMap<TaskId, TaskResult>>;

    /// Removes a workflow row together with its task and result rows
    /// (operator pruning). Fails when the workflow is unknown.
    async fn delete_workflow(&self, workflow_id: &str) -> StorageResult<()>;
}
