//! Dependency resolver: per-workflow DAG state and the ready set.

use gleitzeit_core::{
    CoreResult, ErrorStrategy, Task, TaskId, TaskRef, TaskResult, Workflow, WorkflowId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::substitution;

/// Per-workflow adjacency state.
struct WorkflowGraph {
    /// All task ids in the workflow.
    tasks: HashSet<TaskId>,

    /// `dependents[t]` = tasks that list `t` as a dependency, in
    /// submission order.
    dependents: HashMap<TaskId, Vec<TaskId>>,

    /// `unmet[t]` = number of dependencies of `t` not yet completed.
    unmet: HashMap<TaskId, usize>,

    /// Tasks already handed out as ready (released to the queue).
    released: HashSet<TaskId>,

    /// Tasks with a terminal outcome.
    completed: HashSet<TaskId>,
    failed: HashSet<TaskId>,
    cancelled: HashSet<TaskId>,
}

impl WorkflowGraph {
    fn new(workflow: &Workflow) -> Self {
        let mut tasks = HashSet::new();
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut unmet = HashMap::new();

        for task in &workflow.tasks {
            tasks.insert(task.id.clone());
            unmet.insert(task.id.clone(), task.dependencies.len());
        }
        for task in &workflow.tasks {
            for dep in &task.dependencies {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(task.id.clone());
            }
        }

        Self {
            tasks,
            dependents,
            unmet,
            released: HashSet::new(),
            completed: HashSet::new(),
            failed: HashSet::new(),
            cancelled: HashSet::new(),
        }
    }

    fn is_terminal(&self, task_id: &str) -> bool {
        self.completed.contains(task_id)
            || self.failed.contains(task_id)
            || self.cancelled.contains(task_id)
    }

    /// Transitive dependents of `task_id` that have no terminal outcome,
    /// breadth-first.
    fn live_descendants(&self, task_id: &str) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut out = Vec::new();
        queue.push_back(task_id);

        while let Some(current) = queue.pop_front() {
            if let Some(dependents) = self.dependents.get(current) {
                for dependent in dependents {
                    if seen.insert(dependent.clone()) {
                        if !self.is_terminal(dependent) {
                            out.push(dependent.clone());
                        }
                        queue.push_back(dependent);
                    }
                }
            }
        }
        out
    }
}

/// Tracks every in-flight workflow's DAG and decides which tasks are ready.
///
/// Graph state exists from submission until the workflow reaches a
/// terminal status; all public operations are safe from any worker.
pub struct DependencyResolver {
    graphs: Mutex<HashMap<WorkflowId, WorkflowGraph>>,
}

impl DependencyResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self {
            graphs: Mutex::new(HashMap::new()),
        }
    }

    /// Builds adjacency state for a workflow. Validates the DAG (including
    /// acyclicity) and fails without registering anything on a bad
    /// workflow.
    pub fn add_workflow(&self, workflow: &Workflow) -> CoreResult<()> {
        workflow.validate()?;
        let graph = WorkflowGraph::new(workflow);
        self.graphs.lock().insert(workflow.id.clone(), graph);
        debug!(
            "resolver tracking workflow {} ({} tasks)",
            workflow.id,
            workflow.tasks.len()
        );
        Ok(())
    }

    /// Drops a workflow's graph state (terminal status reached).
    pub fn remove_workflow(&self, workflow_id: &str) {
        self.graphs.lock().remove(workflow_id);
    }

    /// Whether the resolver is tracking a workflow.
    pub fn contains_workflow(&self, workflow_id: &str) -> bool {
        self.graphs.lock().contains_key(workflow_id)
    }

    /// Tasks with every dependency completed and no terminal outcome, not
    /// yet released. Read-only; see [`Self::take_ready`].
    pub fn ready_tasks(&self, workflow_id: &str) -> Vec<TaskId> {
        let graphs = self.graphs.lock();
        let Some(graph) = graphs.get(workflow_id) else {
            return Vec::new();
        };
        graph
            .unmet
            .iter()
            .filter(|(id, unmet)| {
                **unmet == 0 && !graph.released.contains(*id) && !graph.is_terminal(id)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Like [`Self::ready_tasks`], but marks the returned tasks as
    /// released so they are handed out exactly once.
    pub fn take_ready(&self, workflow_id: &str) -> Vec<TaskId> {
        let mut graphs = self.graphs.lock();
        let Some(graph) = graphs.get_mut(workflow_id) else {
            return Vec::new();
        };

        let ready: Vec<TaskId> = graph
            .unmet
            .iter()
            .filter(|(id, unmet)| {
                **unmet == 0 && !graph.released.contains(*id) && !graph.is_terminal(id)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &ready {
            graph.released.insert(id.clone());
        }
        ready
    }

    /// Records a completion and returns the dependents whose unmet count
    /// just reached zero. The returned tasks are marked released.
    pub fn on_task_completed(&self, task: &TaskRef) -> Vec<TaskId> {
        let mut graphs = self.graphs.lock();
        let Some(graph) = graphs.get_mut(&task.workflow_id) else {
            return Vec::new();
        };

        // Idempotent: releasing dependents twice would double-run them.
        if !graph.completed.insert(task.task_id.clone()) {
            return Vec::new();
        }

        let mut newly_ready = Vec::new();
        if let Some(dependents) = graph.dependents.get(&task.task_id).cloned() {
            for dependent in dependents {
                let reached_zero = match graph.unmet.get_mut(&dependent) {
                    Some(unmet) => {
                        *unmet = unmet.saturating_sub(1);
                        *unmet == 0
                    }
                    None => false,
                };
                if reached_zero
                    && !graph.is_terminal(&dependent)
                    && graph.released.insert(dependent.clone())
                {
                    newly_ready.push(dependent);
                }
            }
        }
        newly_ready
    }

    /// Records a terminal failure and returns the tasks to cancel under
    /// the workflow's error strategy. Under both strategies every live
    /// transitive dependent of the failed task is cancelled; dependents of
    /// a failed task can never start.
    pub fn on_task_failed(&self, task: &TaskRef, strategy: ErrorStrategy) -> Vec<TaskId> {
        let mut graphs = self.graphs.lock();
        let Some(graph) = graphs.get_mut(&task.workflow_id) else {
            return Vec::new();
        };

        if !graph.failed.insert(task.task_id.clone()) {
            return Vec::new();
        }
        let _ = strategy;

        let cancelled = graph.live_descendants(&task.task_id);
        for id in &cancelled {
            graph.cancelled.insert(id.clone());
        }
        cancelled
    }

    /// Records a cancellation.
    pub fn on_task_cancelled(&self, task: &TaskRef) {
        let mut graphs = self.graphs.lock();
        if let Some(graph) = graphs.get_mut(&task.workflow_id) {
            graph.cancelled.insert(task.task_id.clone());
        }
    }

    /// Replays an already-completed task during recovery without
    /// releasing dependents (they are re-released by the recovery scan).
    pub fn replay_completed(&self, task: &TaskRef) {
        let mut graphs = self.graphs.lock();
        if let Some(graph) = graphs.get_mut(&task.workflow_id) {
            if graph.completed.insert(task.task_id.clone()) {
                graph.released.insert(task.task_id.clone());
                if let Some(dependents) = graph.dependents.get(&task.task_id).cloned() {
                    for dependent in dependents {
                        if let Some(unmet) = graph.unmet.get_mut(&dependent) {
                            *unmet = unmet.saturating_sub(1);
                        }
                    }
                }
            }
        }
    }

    /// Marks a task as already released during recovery (it is queued,
    /// reserved, executing, or retrying in storage).
    pub fn replay_released(&self, task: &TaskRef) {
        let mut graphs = self.graphs.lock();
        if let Some(graph) = graphs.get_mut(&task.workflow_id) {
            graph.released.insert(task.task_id.clone());
        }
    }

    /// Replays a terminal failure or cancellation during recovery.
    pub fn replay_terminal(&self, task: &TaskRef, failed: bool) {
        let mut graphs = self.graphs.lock();
        if let Some(graph) = graphs.get_mut(&task.workflow_id) {
            graph.released.insert(task.task_id.clone());
            if failed {
                graph.failed.insert(task.task_id.clone());
            } else {
                graph.cancelled.insert(task.task_id.clone());
            }
        }
    }

    /// Resolves a task's parameters against prior results (pure; see
    /// [`crate::substitution`]).
    pub fn resolve_params(
        &self,
        task: &Task,
        results: &HashMap<TaskId, TaskResult>,
    ) -> CoreResult<serde_json::Map<String, serde_json::Value>> {
        let known = {
            let graphs = self.graphs.lock();
            graphs
                .get(&task.workflow_id)
                .map(|graph| graph.tasks.clone())
                .unwrap_or_default()
        };
        substitution::resolve_params(&task.id, &task.params, &known, results)
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gleitzeit_core::{CoreError, Task, Workflow};

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, id, "echo/v1", "echo/ping")
            .with_dependencies(deps.iter().map(|s| s.to_string()).collect())
    }

    fn diamond() -> Workflow {
        let mut workflow = Workflow::new("diamond");
        workflow.add_task(task("a", &[]));
        workflow.add_task(task("b", &["a"]));
        workflow.add_task(task("c", &["a"]));
        workflow.add_task(task("d", &["b", "c"]));
        workflow
    }

    fn task_ref(workflow: &Workflow, id: &str) -> TaskRef {
        TaskRef::new(workflow.id.clone(), id)
    }

    #[test]
    fn test_initial_ready_set() {
        let resolver = DependencyResolver::new();
        let workflow = diamond();
        resolver.add_workflow(&workflow).unwrap();

        let ready = resolver.take_ready(&workflow.id);
        assert_eq!(ready, vec!["a".to_string()]);

        // Released tasks are not handed out twice.
        assert!(resolver.take_ready(&workflow.id).is_empty());
    }

    #[test]
    fn test_diamond_release_order() {
        let resolver = DependencyResolver::new();
        let workflow = diamond();
        resolver.add_workflow(&workflow).unwrap();
        resolver.take_ready(&workflow.id);

        let mut newly = resolver.on_task_completed(&task_ref(&workflow, "a"));
        newly.sort();
        assert_eq!(newly, vec!["b".to_string(), "c".to_string()]);

        // d waits for both b and c.
        assert!(resolver.on_task_completed(&task_ref(&workflow, "b")).is_empty());
        assert_eq!(
            resolver.on_task_completed(&task_ref(&workflow, "c")),
            vec!["d".to_string()]
        );
    }

    #[test]
    fn test_duplicate_completion_is_idempotent() {
        let resolver = DependencyResolver::new();
        let workflow = diamond();
        resolver.add_workflow(&workflow).unwrap();
        resolver.take_ready(&workflow.id);

        let first = resolver.on_task_completed(&task_ref(&workflow, "a"));
        assert_eq!(first.len(), 2);
        assert!(resolver.on_task_completed(&task_ref(&workflow, "a")).is_empty());
    }

    #[test]
    fn test_failure_cancels_transitive_dependents() {
        let resolver = DependencyResolver::new();
        let workflow = diamond();
        resolver.add_workflow(&workflow).unwrap();
        resolver.take_ready(&workflow.id);

        let mut cancelled =
            resolver.on_task_failed(&task_ref(&workflow, "a"), ErrorStrategy::FailFast);
        cancelled.sort();
        assert_eq!(
            cancelled,
            vec!["b".to_string(), "c".to_string(), "d".to_string()]
        );
    }

    #[test]
    fn test_failure_after_sibling_completed() {
        let resolver = DependencyResolver::new();
        let workflow = diamond();
        resolver.add_workflow(&workflow).unwrap();
        resolver.take_ready(&workflow.id);

        resolver.on_task_completed(&task_ref(&workflow, "a"));
        resolver.on_task_completed(&task_ref(&workflow, "c"));

        // b fails; c already completed, so only d is cancelled.
        let cancelled =
            resolver.on_task_failed(&task_ref(&workflow, "b"), ErrorStrategy::FailFast);
        assert_eq!(cancelled, vec!["d".to_string()]);
    }

    #[test]
    fn test_cycle_rejected() {
        let resolver = DependencyResolver::new();
        let mut workflow = Workflow::new("cyclic");
        workflow.add_task(task("a", &["b"]));
        workflow.add_task(task("b", &["a"]));

        assert!(matches!(
            resolver.add_workflow(&workflow),
            Err(CoreError::CircularDependency { .. })
        ));
        assert!(!resolver.contains_workflow(&workflow.id));
    }

    #[test]
    fn test_recovery_replay() {
        let resolver = DependencyResolver::new();
        let workflow = diamond();
        resolver.add_workflow(&workflow).unwrap();

        // a completed before the crash; b was queued.
        resolver.replay_completed(&task_ref(&workflow, "a"));
        resolver.replay_released(&task_ref(&workflow, "b"));

        // Only c is newly ready.
        let ready = resolver.take_ready(&workflow.id);
        assert_eq!(ready, vec!["c".to_string()]);

        // Completing b and c releases d as usual.
        resolver.on_task_completed(&task_ref(&workflow, "b"));
        assert_eq!(
            resolver.on_task_completed(&task_ref(&workflow, "c")),
            vec!["d".to_string()]
        );
    }
}
