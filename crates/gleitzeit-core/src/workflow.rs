//! Workflow definitions: DAGs of tasks submitted as one unit.

use crate::error::{CoreError, CoreResult};
use crate::task::{Priority, Task, TaskId, TaskStatus, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Workflow execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Accepted, not yet started.
    Pending,
    /// At least one task has been released for execution.
    Running,
    /// Terminal: every task completed.
    Completed,
    /// Terminal: at least one task failed under the error strategy.
    Failed,
    /// Terminal: cancelled by the operator.
    Cancelled,
}

impl WorkflowStatus {
    /// Returns true if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Validates a status transition.
    pub fn can_transition_to(&self, next: &WorkflowStatus) -> bool {
        match (self, next) {
            (WorkflowStatus::Pending, WorkflowStatus::Running) => true,
            (WorkflowStatus::Pending, WorkflowStatus::Cancelled) => true,
            (WorkflowStatus::Running, WorkflowStatus::Completed) => true,
            (WorkflowStatus::Running, WorkflowStatus::Failed) => true,
            (WorkflowStatus::Running, WorkflowStatus::Cancelled) => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// What a terminal task failure does to the rest of the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// First terminal failure fails the workflow and cancels every
    /// not-yet-started task transitively.
    #[default]
    FailFast,

    /// A failed task cancels only its own transitive dependents; unrelated
    /// branches keep running, and the workflow ends `failed` if any task
    /// failed.
    ContinueOnError,
}

/// A DAG of tasks submitted as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Globally unique workflow identifier.
    pub id: WorkflowId,

    /// Workflow name.
    pub name: String,

    /// Optional description.
    pub description: Option<String>,

    /// Default priority for tasks that do not set their own.
    #[serde(default)]
    pub priority: Priority,

    /// Tasks in submission order.
    pub tasks: Vec<Task>,

    /// Error strategy.
    #[serde(default)]
    pub error_strategy: ErrorStrategy,

    /// Current status.
    pub status: WorkflowStatus,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Timestamp of the `running` transition.
    pub started_at: Option<DateTime<Utc>>,

    /// Timestamp of the terminal transition.
    pub completed_at: Option<DateTime<Utc>>,

    /// Custom metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Workflow {
    /// Creates an empty pending workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            priority: Priority::default(),
            tasks: Vec::new(),
            error_strategy: ErrorStrategy::default(),
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata: HashMap::new(),
        }
    }

    /// Adds a task, stamping its `workflow_id`.
    pub fn add_task(&mut self, mut task: Task) -> TaskId {
        task.workflow_id = self.id.clone();
        let id = task.id.clone();
        self.tasks.push(task);
        id
    }

    /// Gets a task by id.
    pub fn get_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Applies a status transition, stamping timestamps.
    pub fn update_status(&mut self, status: WorkflowStatus) {
        if status == WorkflowStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = status;
    }

    /// Validates the workflow as a submittable DAG.
    ///
    /// Checks: non-empty task list, unique task ids, every dependency
    /// references a task in this workflow, and the dependency relation is
    /// acyclic.
    pub fn validate(&self) -> CoreResult<()> {
        if self.tasks.is_empty() {
            return Err(CoreError::Validation(
                "workflow must contain at least one task".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for task in &self.tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "duplicate task id: {}",
                    task.id
                )));
            }
            if task.retry.max_attempts == 0 {
                return Err(CoreError::Validation(format!(
                    "task {}: max_attempts must be >= 1",
                    task.id
                )));
            }
        }

        for task in &self.tasks {
            for dep in &task.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(CoreError::Validation(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
                if dep == &task.id {
                    return Err(CoreError::CircularDependency {
                        cycle: vec![task.id.clone(), task.id.clone()],
                    });
                }
            }
        }

        self.check_acyclic()?;
        Ok(())
    }

    /// DFS cycle detection over the dependency relation. Reports the
    /// offending cycle on failure.
    fn check_acyclic(&self) -> CoreResult<()> {
        let deps: HashMap<&str, &Vec<TaskId>> = self
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), &t.dependencies))
            .collect();

        // 0 = unvisited, 1 = on the current path, 2 = done.
        let mut state: HashMap<&str, u8> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();

        fn visit<'a>(
            node: &'a str,
            deps: &HashMap<&'a str, &'a Vec<TaskId>>,
            state: &mut HashMap<&'a str, u8>,
            stack: &mut Vec<&'a str>,
        ) -> CoreResult<()> {
            match state.get(node) {
                Some(1) => {
                    let start = stack.iter().position(|n| *n == node).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(node.to_string());
                    return Err(CoreError::CircularDependency { cycle });
                }
                Some(2) => return Ok(()),
                _ => {}
            }

            state.insert(node, 1);
            stack.push(node);
            if let Some(node_deps) = deps.get(node) {
                for dep in node_deps.iter() {
                    visit(dep.as_str(), deps, state, stack)?;
                }
            }
            stack.pop();
            state.insert(node, 2);
            Ok(())
        }

        for task in &self.tasks {
            visit(task.id.as_str(), &deps, &mut state, &mut stack)?;
        }
        Ok(())
    }

    /// Counts tasks by status.
    pub fn task_status_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in &self.tasks {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }
}

/// Condensed workflow row returned by list APIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    /// Workflow id.
    pub id: WorkflowId,
    /// Workflow name.
    pub name: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Priority.
    pub priority: Priority,
    /// Number of tasks.
    pub task_count: usize,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Terminal timestamp, if any.
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Workflow> for WorkflowSummary {
    fn from(w: &Workflow) -> Self {
        Self {
            id: w.id.clone(),
            name: w.name.clone(),
            status: w.status,
            priority: w.priority,
            task_count: w.tasks.len(),
            created_at: w.created_at,
            completed_at: w.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, id, "echo/v1", "echo/ping")
            .with_dependencies(deps.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let workflow = Workflow::new("empty");
        assert!(matches!(
            workflow.validate(),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_valid_diamond() {
        let mut workflow = Workflow::new("diamond");
        workflow.add_task(task("a", &[]));
        workflow.add_task(task("b", &["a"]));
        workflow.add_task(task("c", &["a"]));
        workflow.add_task(task("d", &["b", "c"]));
        assert!(workflow.validate().is_ok());
    }

    #[test]
    fn test_cycle_detected() {
        let mut workflow = Workflow::new("cyclic");
        workflow.add_task(task("a", &["b"]));
        workflow.add_task(task("b", &["a"]));

        match workflow.validate() {
            Err(CoreError::CircularDependency { cycle }) => {
                assert!(cycle.len() >= 2);
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut workflow = Workflow::new("dangling");
        workflow.add_task(task("a", &["missing"]));
        assert!(matches!(workflow.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut workflow = Workflow::new("dupes");
        workflow.add_task(task("a", &[]));
        workflow.add_task(task("a", &[]));
        assert!(matches!(workflow.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_workflow_transitions() {
        assert!(WorkflowStatus::Pending.can_transition_to(&WorkflowStatus::Running));
        assert!(WorkflowStatus::Running.can_transition_to(&WorkflowStatus::Failed));
        assert!(!WorkflowStatus::Completed.can_transition_to(&WorkflowStatus::Running));
    }
}
