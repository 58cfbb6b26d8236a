//! Declarative workflow submission documents (YAML or JSON).

use crate::error::CoreResult;
use crate::task::{Priority, RetryConfig, Task, TaskRequirements};
use crate::workflow::{ErrorStrategy, Workflow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Retry block of a task document. Delays are seconds; fractions allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryDocument {
    /// Maximum number of attempts (>= 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in seconds.
    #[serde(default = "default_base_delay")]
    pub base_delay: f64,

    /// Upper bound on any single delay, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,

    /// Multiplier applied per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Whether to randomize delays.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryDocument {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl From<RetryDocument> for RetryConfig {
    fn from(doc: RetryDocument) -> Self {
        RetryConfig {
            max_attempts: doc.max_attempts,
            base_delay_ms: (doc.base_delay * 1_000.0) as u64,
            max_delay_ms: (doc.max_delay * 1_000.0) as u64,
            backoff_multiplier: doc.backoff_multiplier,
            jitter: doc.jitter,
        }
    }
}

/// One task entry in a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDocument {
    /// Task id; auto-generated when absent.
    pub id: Option<String>,

    /// Human-readable name.
    pub name: String,

    /// Target protocol, e.g. `"llm/v1"`.
    pub protocol: String,

    /// Protocol method, e.g. `"llm/chat"`.
    pub method: String,

    /// Method parameters. String values may contain `${task.path}` tokens.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,

    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Task priority; defaults to the workflow priority.
    pub priority: Option<Priority>,

    /// Provider selection constraints.
    #[serde(default)]
    pub requirements: TaskRequirements,

    /// Per-attempt execution deadline in seconds.
    pub timeout: Option<u64>,

    /// Retry policy.
    pub retry: Option<RetryDocument>,
}

/// A declarative workflow submission document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDocument {
    /// Workflow name.
    pub name: String,

    /// Optional description.
    pub description: Option<String>,

    /// Workflow priority; the default for tasks that set none.
    #[serde(default)]
    pub priority: Priority,

    /// Error strategy; defaults to fail-fast.
    #[serde(default)]
    pub error_strategy: ErrorStrategy,

    /// Tasks, non-empty.
    pub tasks: Vec<TaskDocument>,

    /// Custom metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl WorkflowDocument {
    /// Parses a YAML document.
    pub fn from_yaml(input: &str) -> CoreResult<Self> {
        Ok(serde_yaml::from_str(input)?)
    }

    /// Parses a JSON document.
    pub fn from_json(input: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(input)?)
    }

    /// Parses a document, sniffing JSON vs YAML from the first
    /// non-whitespace byte.
    pub fn parse(input: &str) -> CoreResult<Self> {
        match input.trim_start().chars().next() {
            Some('{') => Self::from_json(input),
            _ => Self::from_yaml(input),
        }
    }

    /// Converts the document into a validated workflow.
    ///
    /// Missing task ids are generated, per-task priorities default to the
    /// workflow priority, and the resulting DAG is validated before
    /// anything is returned.
    pub fn into_workflow(self) -> CoreResult<Workflow> {
        let mut workflow = Workflow::new(self.name);
        workflow.description = self.description;
        workflow.priority = self.priority;
        workflow.error_strategy = self.error_strategy;
        workflow.metadata = self.metadata;

        let default_priority = workflow.priority;
        for doc in self.tasks {
            let id = doc
                .id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            let mut task = Task::new(id, doc.name, doc.protocol, doc.method)
                .with_params(doc.params)
                .with_dependencies(doc.dependencies)
                .with_priority(doc.priority.unwrap_or(default_priority))
                .with_requirements(doc.requirements)
                .with_retry(doc.retry.unwrap_or_default().into());
            task.timeout_seconds = doc.timeout;

            workflow.add_task(task);
        }

        workflow.validate()?;
        Ok(workflow)
    }
}
