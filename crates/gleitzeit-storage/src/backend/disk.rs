//! Disk storage backend: JSON files with write-through caching.

use async_trait::async_trait;
use gleitzeit_core::{
    Task, TaskId, TaskRef, TaskResult, TaskStatus, Workflow, WorkflowSummary,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{StatusUpdate, StorageBackend, WorkflowPage};
use crate::error::{StorageError, StorageResult};

/// Disk storage configuration.
#[derive(Debug, Clone)]
pub struct DiskStorageConfig {
    /// Root directory for all state files.
    pub root_dir: PathBuf,

    /// Fsync every file after writing.
    pub sync_writes: bool,
}

impl Default for DiskStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(".gleitzeit"),
            sync_writes: false,
        }
    }
}

#[derive(Default)]
struct Tables {
    workflows: HashMap<String, Workflow>,
    tasks: HashMap<TaskRef, Task>,
    results: HashMap<TaskRef, TaskResult>,
}

/// Disk storage backend.
///
/// Rows are JSON files under `workflows/`, `tasks/<workflow>/`, and
/// `results/<workflow>/`. Every write goes temp-file-then-rename so a
/// crash never leaves a half-written row, and the full state is cached in
/// memory (reloaded by `initialize`), so reads never touch the disk.
pub struct DiskStorage {
    config: DiskStorageConfig,
    tables: RwLock<Tables>,
}

/// Maps an id onto a safe file-name component. Ids are uuid-generated in
/// practice; user-supplied ids only need to avoid path separators.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl DiskStorage {
    /// Creates a disk store rooted at the configured directory. Call
    /// [`StorageBackend::initialize`] before use.
    pub fn new(config: DiskStorageConfig) -> Self {
        Self {
            config,
            tables: RwLock::new(Tables::default()),
        }
    }

    /// Creates a disk store with default settings in the given directory.
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self::new(DiskStorageConfig {
            root_dir: root_dir.into(),
            ..Default::default()
        })
    }

    fn workflows_dir(&self) -> PathBuf {
        self.config.root_dir.join("workflows")
    }

    fn tasks_dir(&self) -> PathBuf {
        self.config.root_dir.join("tasks")
    }

    fn results_dir(&self) -> PathBuf {
        self.config.root_dir.join("results")
    }

    fn workflow_path(&self, id: &str) -> PathBuf {
        self.workflows_dir().join(format!("{}.json", sanitize(id)))
    }

    fn task_path(&self, task: &TaskRef) -> PathBuf {
        self.tasks_dir()
            .join(sanitize(&task.workflow_id))
            .join(format!("{}.json", sanitize(&task.task_id)))
    }

    fn result_path(&self, task: &TaskRef) -> PathBuf {
        self.results_dir()
            .join(sanitize(&task.workflow_id))
            .join(format!("{}.json", sanitize(&task.task_id)))
    }

    /// Writes a JSON value durably: temp file, optional fsync, rename.
    async fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;

        if self.config.sync_writes {
            let file = fs::OpenOptions::new().write(true).open(&tmp).await?;
            file.sync_all().await?;
        }

        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Loads every JSON row in a directory, skipping unreadable files.
    async fn load_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> StorageResult<Vec<T>> {
        let mut rows = Vec::new();
        if !dir.exists() {
            return Ok(rows);
        }

        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                let mut nested = fs::read_dir(&path).await?;
                while let Some(file) = nested.next_entry().await? {
                    Self::load_file(&file.path(), &mut rows).await;
                }
            } else {
                Self::load_file(&path, &mut rows).await;
            }
        }
        Ok(rows)
    }

    async fn load_file<T: serde::de::DeserializeOwned>(path: &Path, rows: &mut Vec<T>) {
        if path.extension().map(|e| e != "json").unwrap_or(true) {
            return;
        }
        match fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(row) => rows.push(row),
                Err(err) => warn!("skipping corrupt row {}: {}", path.display(), err),
            },
            Err(err) => warn!("skipping unreadable row {}: {}", path.display(), err),
        }
    }
}

#[async_trait]
impl StorageBackend for DiskStorage {
    async fn initialize(&self) -> StorageResult<()> {
        fs::create_dir_all(self.workflows_dir()).await?;
        fs::create_dir_all(self.tasks_dir()).await?;
        fs::create_dir_all(self.results_dir()).await?;

        let workflows: Vec<Workflow> = Self::load_dir(&self.workflows_dir()).await?;
        let tasks: Vec<Task> = Self::load_dir(&self.tasks_dir()).await?;
        let results: Vec<TaskResult> = Self::load_dir(&self.results_dir()).await?;

        let mut tables = self.tables.write().await;
        tables.workflows = workflows.into_iter().map(|w| (w.id.clone(), w)).collect();
        tables.tasks = tasks
            .into_iter()
            .map(|t| (TaskRef::from(&t), t))
            .collect();
        tables.results = results
            .into_iter()
            .map(|r| (TaskRef::new(r.workflow_id.clone(), r.task_id.clone()), r))
            .collect();

        info!(
            "disk storage initialized at {} ({} workflows, {} tasks, {} results)",
            self.config.root_dir.display(),
            tables.workflows.len(),
            tables.tasks.len(),
            tables.results.len()
        );
        Ok(())
    }

    async fn shutdown(&self) -> StorageResult<()> {
        debug!("disk storage shut down");
        Ok(())
    }

    async fn save_workflow(&self, workflow: &Workflow) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        self.write_json(&self.workflow_path(&workflow.id), workflow)
            .await?;
        tables
            .workflows
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> StorageResult<Option<Workflow>> {
        Ok(self.tables.read().await.workflows.get(id).cloned())
    }

    async fn list_workflows(
        &self,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<WorkflowPage> {
        let tables = self.tables.read().await;
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
        let mut tables = self.tables.write().await;
        let task_ref = TaskRef::from(task);
        self.write_json(&self.task_path(&task_ref), task).await?;
        tables.tasks.insert(task_ref, task.clone());
        Ok(())
    }

    async fn get_task(&self, task: &TaskRef) -> StorageResult<Option<Task>> {
        Ok(self.tables.read().await.tasks.get(task).cloned())
    }

    async fn get_tasks_by_status(&self, status: TaskStatus) -> StorageResult<Vec<Task>> {
        Ok(self
            .tables
            .read()
            .await
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
            .await
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
        let mut tables = self.tables.write().await;
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

        let row = task.clone();
        self.write_json(&self.task_path(task_ref), &row).await?;
        Ok(())
    }

    async fn save_task_result(&self, result: &TaskResult) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let key = TaskRef::new(result.workflow_id.clone(), result.task_id.clone());

        if let Some(existing) = tables.results.get(&key) {
            if existing.status == TaskStatus::Completed {
                return Ok(());
            }
        }

        self.write_json(&self.result_path(&key), result).await?;
        tables.results.insert(key, result.clone());
        Ok(())
    }

    async fn get_task_result(&self, task: &TaskRef) -> StorageResult<Option<TaskResult>> {
        Ok(self.tables.read().await.results.get(task).cloned())
    }

    async fn get_workflow_results(
        &self,
        workflow_id: &str,
    ) -> StorageResult<HashMap<TaskId, TaskResult>> {
        Ok(self
            .tables
            .read()
            .await
            .results
            .iter()
            .filter(|(key, _)| key.workflow_id == workflow_id)
            .map(|(key, result)| (key.task_id.clone(), result.clone()))
            .collect())
    }

    async fn delete_workflow(&self, workflow_id: &str) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .workflows
            .remove(workflow_id)
            .ok_or_else(|| StorageError::NotFound(format!("workflow {}", workflow_id)))?;
        tables.tasks.retain(|key, _| key.workflow_id != workflow_id);
        tables.results.retain(|key, _| key.workflow_id != workflow_id);

        let _ = fs::remove_file(self.workflow_path(workflow_id)).await;
        let _ = fs::remove_dir_all(self.tasks_dir().join(sanitize(workflow_id))).await;
        let _ = fs::remove_dir_all(self.results_dir().join(sanitize(workflow_id))).await;
        Ok(())
    }
}
