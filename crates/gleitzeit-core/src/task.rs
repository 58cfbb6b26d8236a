//! Task definitions: the unit of work routed to a protocol provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// A unique identifier for a task. Opaque, stable, unique within a workflow.
pub type TaskId = String;

/// A unique identifier for a workflow. Globally unique.
pub type WorkflowId = String;

/// A protocol identifier, e.g. `"llm/v1"`.
pub type ProtocolId = String;

/// A provider identifier.
pub type ProviderId = String;

/// Workflow-scoped task key.
///
/// Task ids are only unique within their workflow, so every component that
/// indexes tasks across workflows (queue, timer, storage) keys them by this
/// pair instead of the bare id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskRef {
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// Task id within the workflow.
    pub task_id: TaskId,
}

impl TaskRef {
    /// Creates a reference from its parts.
    pub fn new(workflow_id: impl Into<WorkflowId>, task_id: impl Into<TaskId>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_id: task_id.into(),
        }
    }
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.task_id)
    }
}

impl From<&Task> for TaskRef {
    fn from(task: &Task) -> Self {
        Self {
            workflow_id: task.workflow_id.clone(),
            task_id: task.id.clone(),
        }
    }
}

/// Scheduling priority for tasks and workflows.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority (value: 0).
    Low = 0,
    /// Normal priority (value: 1).
    #[default]
    Normal = 1,
    /// High priority (value: 2).
    High = 2,
    /// Urgent priority (value: 3).
    Urgent = 3,
}

impl Priority {
    /// All priorities, highest first. Queue consumers drain in this order.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Bucket index used by the task queue (0 = low).
    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Task execution status.
///
/// `Retrying` is the persisted substate of a pending task waiting for its
/// delayed re-enqueue; it is not observable as a distinct queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Dependencies not yet satisfied, or not yet enqueued.
    Pending,
    /// In the task queue, visible to consumers.
    Queued,
    /// Reserved by a consumer, invisible until ack/nack/visibility expiry.
    Reserved,
    /// A worker is executing the task.
    Executing,
    /// Waiting for a delayed re-enqueue after a retryable failure.
    Retrying,
    /// Terminal: the task produced a result.
    Completed,
    /// Terminal: the task failed and will not be retried.
    Failed,
    /// Terminal: the workflow was cancelled or a failed dependency
    /// cascaded.
    Cancelled,
}

impl TaskStatus {
    /// Returns true if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Validates a status transition against the task state machine.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        match (self, next) {
            // From Pending
            (TaskStatus::Pending, TaskStatus::Queued) => true,

            // From Queued
            (TaskStatus::Queued, TaskStatus::Reserved) => true,

            // From Reserved
            (TaskStatus::Reserved, TaskStatus::Executing) => true,
            // Visibility expiry returns a reservation to the queue.
            (TaskStatus::Reserved, TaskStatus::Queued) => true,

            // From Executing
            (TaskStatus::Executing, TaskStatus::Completed) => true,
            (TaskStatus::Executing, TaskStatus::Failed) => true,
            (TaskStatus::Executing, TaskStatus::Retrying) => true,

            // From Retrying
            (TaskStatus::Retrying, TaskStatus::Queued) => true,

            // Cancellation is reachable from every non-terminal state.
            (s, TaskStatus::Cancelled) if !s.is_terminal() => true,

            // No transitions out of terminal states; same state is a no-op.
            (a, b) if a == b => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Reserved => "reserved",
            TaskStatus::Executing => "executing",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Constraints a task places on provider selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequirements {
    /// Tags the selected provider must carry (e.g. region, gpu tier).
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Capabilities the selected provider must declare (e.g. model names).
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl TaskRequirements {
    /// No constraints: any provider of the protocol/method qualifies.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether any constraint is set.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.capabilities.is_empty()
    }
}

/// Per-task retry policy with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of execution attempts (>= 1).
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,

    /// Multiplier applied per attempt (typically 2.0 for doubling).
    pub backoff_multiplier: f64,

    /// Whether to randomize delays to avoid thundering herds.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Computes the delay before the retry that follows `attempt` failures.
    ///
    /// `delay = min(max_delay, base_delay * multiplier^(attempt - 1))`,
    /// multiplied by a uniform factor in `[0.75, 1.25]` when jitter is on.
    /// Returns `None` once attempts are exhausted.
    pub fn delay_after_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt >= self.max_attempts {
            return None;
        }

        let exponential =
            (self.base_delay_ms as f64) * self.backoff_multiplier.powi(attempt as i32 - 1);
        let mut delay_ms = exponential.min(self.max_delay_ms as f64);

        if self.jitter {
            let factor: f64 = 0.75 + rand::random::<f64>() * 0.5;
            delay_ms = (delay_ms * factor).min(self.max_delay_ms as f64);
        }

        Some(Duration::from_millis(delay_ms as u64))
    }
}

/// A single invocation of a protocol method with parameters and dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier within the workflow.
    pub id: TaskId,

    /// Human-readable task name.
    pub name: String,

    /// Owning workflow.
    pub workflow_id: WorkflowId,

    /// Protocol the task targets, e.g. `"llm/v1"`.
    pub protocol: ProtocolId,

    /// Protocol method, e.g. `"llm/chat"`.
    pub method: String,

    /// Method parameters. Insertion order is preserved; values may contain
    /// `${task.path}` substitution tokens in strings. Immutable after
    /// submission.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,

    /// Ids of tasks in the same workflow that must complete first.
    /// Immutable after submission.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,

    /// Scheduling priority.
    #[serde(default)]
    pub priority: Priority,

    /// Provider selection constraints.
    #[serde(default)]
    pub requirements: TaskRequirements,

    /// Per-attempt execution deadline. Falls back to the engine default.
    pub timeout_seconds: Option<u64>,

    /// Retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Current status.
    pub status: TaskStatus,

    /// 1-indexed count of how many times the task has entered `executing`.
    pub attempt: u32,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Timestamp of the latest `executing` transition.
    pub started_at: Option<DateTime<Utc>>,

    /// Timestamp of the terminal transition.
    pub completed_at: Option<DateTime<Utc>>,

    /// Custom metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Task {
    /// Creates a new pending task.
    pub fn new(
        id: impl Into<TaskId>,
        name: impl Into<String>,
        protocol: impl Into<ProtocolId>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            workflow_id: String::new(),
            protocol: protocol.into(),
            method: method.into(),
            params: serde_json::Map::new(),
            dependencies: Vec::new(),
            priority: Priority::default(),
            requirements: TaskRequirements::default(),
            timeout_seconds: None,
            retry: RetryConfig::default(),
            status: TaskStatus::Pending,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata: HashMap::new(),
        }
    }

    /// Sets the parameters.
    pub fn with_params(mut self, params: serde_json::Map<String, serde_json::Value>) -> Self {
        self.params = params;
        self
    }

    /// Sets the dependencies.
    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    /// Sets the provider selection constraints.
    pub fn with_requirements(mut self, requirements: TaskRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Applies a status transition, stamping timestamps.
    ///
    /// `executing` stamps `started_at` and increments `attempt`; terminal
    /// states stamp `completed_at`.
    pub fn update_status(&mut self, status: TaskStatus) {
        if status == TaskStatus::Executing {
            self.started_at = Some(Utc::now());
            self.attempt += 1;
        }
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = status;
    }

    /// Per-attempt deadline, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// Whether every dependency id is in the given completed set.
    pub fn is_ready(&self, completed: &std::collections::HashSet<TaskId>) -> bool {
        self.dependencies.iter().all(|dep| completed.contains(dep))
    }
}

/// Result of a task execution. The `result` value is what dependent tasks
/// substitute from; it is immutable once the task is completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task that produced the result.
    pub task_id: TaskId,

    /// Owning workflow.
    pub workflow_id: WorkflowId,

    /// Terminal status of the producing attempt.
    pub status: TaskStatus,

    /// JSON-serializable output value.
    pub result: serde_json::Value,

    /// Error message if the task failed.
    pub error: Option<String>,

    /// Start of the producing attempt.
    pub started_at: Option<DateTime<Utc>>,

    /// End of the producing attempt.
    pub completed_at: Option<DateTime<Utc>>,

    /// Attempt number that produced this result.
    pub attempt: u32,

    /// Custom metadata. Provider detail (stack traces) lands here, not in
    /// list APIs.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl TaskResult {
    /// Builds a successful result for a task.
    pub fn success(task: &Task, result: serde_json::Value) -> Self {
        Self {
            task_id: task.id.clone(),
            workflow_id: task.workflow_id.clone(),
            status: TaskStatus::Completed,
            result,
            error: None,
            started_at: task.started_at,
            completed_at: Some(Utc::now()),
            attempt: task.attempt,
            metadata: HashMap::new(),
        }
    }

    /// Builds a terminal failure result for a task.
    pub fn failure(task: &Task, error: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            workflow_id: task.workflow_id.clone(),
            status: TaskStatus::Failed,
            result: serde_json::Value::Null,
            error: Some(error.into()),
            started_at: task.started_at,
            completed_at: Some(Utc::now()),
            attempt: task.attempt,
            metadata: HashMap::new(),
        }
    }

    /// Builds a cancellation record for a task.
    pub fn cancelled(task: &Task, reason: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            workflow_id: task.workflow_id.clone(),
            status: TaskStatus::Cancelled,
            result: serde_json::Value::Null,
            error: Some(reason.into()),
            started_at: task.started_at,
            completed_at: Some(Utc::now()),
            attempt: task.attempt,
            metadata: HashMap::new(),
        }
    }
}
