//! In-memory storage backend: the reference implementation and test store.

use async_trait::async_trait;
use gleitzeit_core::{
    Task, TaskId, TaskRef, TaskResult, TaskStatus, Workflow, WorkflowSummary,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

use super::{StatusUpdate, StorageBackend, WorkflowPage};
use crate::error::{StorageError, StorageResult};

#[derive(Default)]
struct Tables {
    workflows: HashMap<String, Workflow>,
    tasks: HashMap<TaskRef, Task>,
    results: HashMap<TaskRef, TaskResult>,
}

/// In-memory storage backend.
///
/// All tables live behind one `RwLock`, which gives every operation the
/// contract's per-operation atomicity. State is lost on drop; durability
/// across restarts is what [`super::disk::DiskStorage`] is for.
#[derive(Default)]
pub struct MemoryStorage {
    tables: RwLock<Tables>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workflow rows. Test helper.
    pub fn workflow_count(&self) -> usize {
        self.tables.read().workflows.len()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn initialize(&self) -> StorageResult<()> {
        debug!("memory storage initialized");
        Ok(())
    }

    async fn shutdown(&self) -> StorageResult<()> {
        debug!("memory storage shut down");
        Ok(())
    }

    async fn save_workflow(&self, workflow: &Workflow) -> StorageResult<()> {
        let mut tables = self.tables.write();
        tables
            .workflows
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> StorageResult<Option<Workflow>> {
        Ok(self.tables.read().workflows.get(id).cloned())
    }

    async fn list_workflows(
        &self,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<WorkflowPage> {
        let tables = self.tables.read();
        let mut ids: Vec<&String> = tables.workflows.keys().collect();
        ids.sort();

        let start = match &cursor {
            Some(c) => ids.partition_point(|id| id.as_str() <= c.as_str()),
            None => 0,
        };

        let page: Vec<WorkflowSummary> = ids[start..]
            .iter()
            .take(limit)
            .map(|id| WorkflowSummary::from(&tables.workflows[*id]))
            .collect();

        let next_cursor = if start + page.len() < ids.len() {
            page.last().map(|w| w.id.clone())
        } else {
            None
        };

        Ok(WorkflowPage {
            workflows: page,
            next_cursor,
        })
    }

    async fn save_task(&self, task: &Task) -> StorageResult<()> {
        let mut tables = self.tables.write();
        tables.tasks.insert(TaskRef::from(task), task.clone());
        Ok(())
    }

    async fn get_task(&self, task: &TaskRef) -> StorageResult<Option<Task>> {
        Ok(self.tables.read().tasks.get(task).cloned())
    }

    async fn get_tasks_by_status(&self, status: TaskStatus) -> StorageResult<Vec<Task>> {
        Ok(self
            .tables
            .read()
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn get_tasks_by_workflow(&self, workflow_id: &str) -> StorageResult<Vec<Task>> {
        Ok(self
            .tables
            .read()
            .tasks
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn update_task_status(
        &self,
        task_ref: &TaskRef,
        status: TaskStatus,
        update: StatusUpdate,
    ) -> StorageResult<()> {
        let mut tables = self.tables.write();
        let task = tables
            .tasks
            .get_mut(task_ref)
            .ok_or_else(|| StorageError::NotFound(format!("task {}", task_ref)))?;

        if !task.status.can_transition_to(&status) {
            return Err(StorageError::InvalidTransition {
                task: task_ref.to_string(),
                from: task.status.to_string(),
                to: status.to_string(),
            });
        }

        task.status = status;
        if let Some(started_at) = update.started_at {
            task.started_at = Some(started_at);
        }
        if let Some(completed_at) = update.completed_at {
            task.completed_at = Some(completed_at);
        }
        if let Some(attempt) = update.attempt {
            task.attempt = attempt;
        }
        Ok(())
    }

    async fn save_task_result(&self, result: &TaskResult) -> StorageResult<()> {
        let mut tables = self.tables.write();
        let key = TaskRef::new(result.workflow_id.clone(), result.task_id.clone());

        // A completed result is immutable; duplicate completions are a
        // no-op and later failures must not clobber a success.
        if let Some(existing) = tables.results.get(&key) {
            if existing.status == TaskStatus::Completed {
                return Ok(());
            }
        }

        tables.results.insert(key, result.clone());
        Ok(())
    }

    async fn get_task_result(&self, task: &TaskRef) -> StorageResult<Option<TaskResult>> {
        Ok(self.tables.read().results.get(task).cloned())
    }

    async fn get_workflow_results(
        &self,
        workflow_id: &str,
    ) -> StorageResult<HashMap<TaskId, TaskResult>> {
        Ok(self
            .tables
            .read()
            .results
            .iter()
            .filter(|(key, _)| key.workflow_id == workflow_id)
            .map(|(key, result)| (key.task_id.clone(), result.clone()))
            .collect())
    }

    async fn delete_workflow(&self, workflow_id: &str) -> StorageResult<()> {
        let mut tables = self.tables.write();
        tables
            .workflows
            .remove(workflow_id)
            .ok_or_else(|| StorageError::NotFound(format!("workflow {}", workflow_id)))?;
        tables.tasks.retain(|key, _| key.workflow_id != workflow_id);
        tables.results.retain(|key, _| key.workflow_id != workflow_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gleitzeit_core::Workflow;

    fn sample_workflow(name: &str) -> Workflow {
        let mut workflow = Workflow::new(name);
        workflow.add_task(Task::new("a", "a", "echo/v1", "echo/ping"));
        workflow
    }

    #[tokio::test]
    async fn test_workflow_round_trip() {
        let storage = MemoryStorage::new();
        let workflow = sample_workflow("wf");

        storage.save_workflow(&workflow).await.unwrap();
        let loaded = storage.get_workflow(&workflow.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "wf");

        assert!(storage.get_workflow("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_task_status_update() {
        let storage = MemoryStorage::new();
        let workflow = sample_workflow("wf");
        let task = workflow.tasks[0].clone();
        let task_ref = TaskRef::from(&task);

        storage.save_task(&task).await.unwrap();

        storage
            .update_task_status(&task_ref, TaskStatus::Queued, StatusUpdate::none())
            .await
            .unwrap();

        let loaded = storage.get_task(&task_ref).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Queued);

        // Invalid transition is rejected.
        let err = storage
            .update_task_status(&task_ref, TaskStatus::Executing, StatusUpdate::none())
            .await;
        assert!(matches!(err, Err(StorageError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_completed_result_is_immutable() {
        let storage = MemoryStorage::new();
        let workflow = sample_workflow("wf");
        let task = workflow.tasks[0].clone();
        let task_ref = TaskRef::from(&task);

        let success = TaskResult::success(&task, serde_json::json!({"n": 1}));
        storage.save_task_result(&success).await.unwrap();

        let failure = TaskResult::failure(&task, "late failure");
        storage.save_task_result(&failure).await.unwrap();

        let loaded = storage.get_task_result(&task_ref).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.result, serde_json::json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_tasks_by_status() {
        let storage = MemoryStorage::new();
        let workflow = sample_workflow("wf");
        let task = workflow.tasks[0].clone();
        let task_ref = TaskRef::from(&task);

        storage.save_task(&task).await.unwrap();
        assert_eq!(
            storage
                .get_tasks_by_status(TaskStatus::Pending)
                .await
                .unwrap()
                .len(),
            1
        );

        storage
            .update_task_status(&task_ref, TaskStatus::Queued, StatusUpdate::none())
            .await
            .unwrap();

        assert!(storage
            .get_tasks_by_status(TaskStatus::Pending)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            storage
                .get_tasks_by_status(TaskStatus::Queued)
                .await
                .unwrap()[0]
                .id,
            task.id
        );
    }

    #[tokio::test]
    async fn test_same_task_id_across_workflows() {
        let storage = MemoryStorage::new();
        let w1 = sample_workflow("one");
        let w2 = sample_workflow("two");

        storage.save_task(&w1.tasks[0]).await.unwrap();
        storage.save_task(&w2.tasks[0]).await.unwrap();

        let t1 = storage
            .get_task(&TaskRef::from(&w1.tasks[0]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t1.workflow_id, w1.id);

        assert_eq!(storage.get_tasks_by_workflow(&w2.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_workflow_prunes_everything() {
        let storage = MemoryStorage::new();
        let workflow = sample_workflow("wf");
        let task = workflow.tasks[0].clone();

        storage.save_workflow(&workflow).await.unwrap();
        storage.save_task(&task).await.unwrap();
        storage
            .save_task_result(&TaskResult::success(&task, serde_json::json!(1)))
            .await
            .unwrap();

        storage.delete_workflow(&workflow.id).await.unwrap();

        assert!(storage.get_workflow(&workflow.id).await.unwrap().is_none());
        assert!(storage
            .get_task(&TaskRef::from(&task))
            .await
            .unwrap()
            .is_none());
        assert!(storage
            .get_workflow_results(&workflow.id)
            .await
            .unwrap()
            .is_empty());

        assert!(matches!(
            storage.delete_workflow(&workflow.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_listing_pagination() {
        let storage = MemoryStorage::new();
        for i in 0..5 {
            let mut workflow = sample_workflow(&format!("wf-{}", i));
            workflow.id = format!("{:02}", i);
            storage.save_workflow(&workflow).await.unwrap();
        }

        let page = storage.list_workflows(2, None).await.unwrap();
        assert_eq!(page.workflows.len(), 2);
        assert_eq!(page.workflows[0].id, "00");
        let cursor = page.next_cursor.clone().unwrap();

        let page = storage.list_workflows(2, Some(cursor)).await.unwrap();
        assert_eq!(page.workflows[0].id, "02");

        let page = storage
            .list_workflows(10, Some("03".to_string()))
            .await
            .unwrap();
        assert_eq!(page.workflows.len(), 1);
        assert!(page.next_cursor.is_none());
    }
}
