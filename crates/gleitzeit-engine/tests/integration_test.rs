//! End-to-end scenarios for the Gleitzeit execution engine.

use async_trait::async_trait;
use gleitzeit_core::{
    ErrorKind, ErrorStrategy, InvocationError, InvocationRequest, InvocationResponse, MethodSpec,
    Priority, ProtocolSpec, RetryConfig, Task, TaskRequirements, TaskStatus, Workflow,
    WorkflowStatus,
};
use gleitzeit_engine::{EngineConfig, EngineEvent, ExecutionEngine};
use gleitzeit_queue::QueueConfig;
use gleitzeit_registry::{EchoProvider, ProviderClient, ProviderHandle, ProviderRegistration};
use gleitzeit_storage::{MemoryStorage, StorageBackend};
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);

fn test_config() -> EngineConfig {
    EngineConfig {
        workers: 4,
        poll_interval: Duration::from_millis(10),
        selection_backoff: Duration::from_millis(20),
        ..Default::default()
    }
}

fn register_echo(engine: &ExecutionEngine, provider: EchoProvider) {
    let registry = engine.registry();
    registry
        .register_protocol(EchoProvider::protocol_spec())
        .unwrap();
    registry
        .register_provider(ProviderRegistration::new(
            provider.name().to_string(),
            "echo/v1",
            ProviderHandle::Local(Arc::new(provider)),
            EchoProvider::methods(),
        ))
        .unwrap();
}

async fn engine_with_echo(storage: Arc<dyn StorageBackend>, provider: EchoProvider) -> ExecutionEngine {
    let engine = ExecutionEngine::new(test_config(), storage);
    register_echo(&engine, provider);
    engine.start().await.unwrap();
    engine
}

fn task(id: &str, method: &str, params: serde_json::Value, deps: &[&str]) -> Task {
    Task::new(id, id, "echo/v1", method)
        .with_params(params.as_object().cloned().unwrap_or_default())
        .with_dependencies(deps.iter().map(|s| s.to_string()).collect())
}

/// Scenario: linear chain with substitution between tasks.
#[tokio::test]
async fn test_linear_chain() {
    let engine = engine_with_echo(Arc::new(MemoryStorage::new()), EchoProvider::new("echo-1")).await;

    let mut workflow = Workflow::new("linear-chain");
    workflow.add_task(task("a", "echo/ping", serde_json::json!({"message": "hi"}), &[]));
    workflow.add_task(task(
        "b",
        "echo/echo",
        serde_json::json!({"value": "${a.response}"}),
        &["a"],
    ));

    let workflow_id = engine.submit(workflow).await.unwrap();
    let status = engine.wait_for_workflow(&workflow_id, WAIT).await.unwrap();
    assert_eq!(status, WorkflowStatus::Completed);

    let results = engine.get_workflow_results(&workflow_id).await.unwrap();
    assert_eq!(results["a"].result, serde_json::json!({"response": "hi"}));
    assert_eq!(results["b"].result, serde_json::json!({"echoed": "hi"}));

    let report = engine.get_workflow_status(&workflow_id).await.unwrap();
    assert!(report.tasks.iter().all(|t| t.status == TaskStatus::Completed));

    engine.stop().await;
}

/// Arithmetic provider for the diamond scenario.
struct MathProvider;

impl MathProvider {
    fn protocol_spec() -> ProtocolSpec {
        ProtocolSpec::new("math/v1")
            .unwrap()
            .with_method(MethodSpec::new("math/const", "Emit a constant"))
            .with_method(MethodSpec::new("math/mul10", "Multiply by ten"))
            .with_method(MethodSpec::new("math/add5", "Add five"))
            .with_method(MethodSpec::new("math/pair", "Pass two values through"))
    }

    fn methods() -> Vec<String> {
        vec![
            "math/const".to_string(),
            "math/mul10".to_string(),
            "math/add5".to_string(),
            "math/pair".to_string(),
        ]
    }
}

#[async_trait]
impl ProviderClient for MathProvider {
    fn name(&self) -> &str {
        "math-1"
    }

    async fn invoke(&self, request: InvocationRequest) -> InvocationResponse {
        let x = request.params.get("x").and_then(|v| v.as_i64()).unwrap_or(0);
        let value = match request.method.as_str() {
            "math/const" => {
                serde_json::json!({"n": request.params.get("n").cloned().unwrap_or_default()})
            }
            "math/mul10" => serde_json::json!({"v": x * 10}),
            "math/add5" => serde_json::json!({"v": x + 5}),
            "math/pair" => serde_json::json!({
                "sum": request.params.get("sum").cloned().unwrap_or_default(),
                "plus": request.params.get("plus").cloned().unwrap_or_default(),
            }),
            other => {
                return InvocationResponse::failure(
                    request.id.clone(),
                    InvocationError::new(
                        ErrorKind::InvalidParameters,
                        format!("unknown method {}", other),
                    ),
                )
            }
        };
        InvocationResponse::success(request.id.clone(), value)
    }
}

/// Scenario: diamond DAG with native-typed substitution at every edge.
#[tokio::test]
async fn test_diamond_with_substitution() {
    let engine = ExecutionEngine::new(test_config(), Arc::new(MemoryStorage::new()));
    engine
        .registry()
        .register_protocol(MathProvider::protocol_spec())
        .unwrap();
    engine
        .registry()
        .register_provider(ProviderRegistration::new(
            "math-1",
            "math/v1",
            ProviderHandle::Local(Arc::new(MathProvider)),
            MathProvider::methods(),
        ))
        .unwrap();
    engine.start().await.unwrap();

    let mut workflow = Workflow::new("diamond");
    workflow.add_task(
        Task::new("a", "a", "math/v1", "math/const")
            .with_params(serde_json::json!({"n": 2}).as_object().cloned().unwrap()),
    );
    workflow.add_task(
        Task::new("b", "b", "math/v1", "math/mul10")
            .with_params(serde_json::json!({"x": "${a.n}"}).as_object().cloned().unwrap())
            .with_dependencies(vec!["a".to_string()]),
    );
    workflow.add_task(
        Task::new("c", "c", "math/v1", "math/add5")
            .with_params(serde_json::json!({"x": "${a.n}"}).as_object().cloned().unwrap())
            .with_dependencies(vec!["a".to_string()]),
    );
    workflow.add_task(
        Task::new("d", "d", "math/v1", "math/pair")
            .with_params(
                serde_json::json!({"sum": "${b.v}", "plus": "${c.v}"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .with_dependencies(vec!["b".to_string(), "c".to_string()]),
    );

    let workflow_id = engine.submit(workflow).await.unwrap();
    let status = engine.wait_for_workflow(&workflow_id, WAIT).await.unwrap();
    assert_eq!(status, WorkflowStatus::Completed);

    let results = engine.get_workflow_results(&workflow_id).await.unwrap();
    assert_eq!(results["d"].result["sum"], serde_json::json!(20));
    assert_eq!(results["d"].result["plus"], serde_json::json!(7));

    // D starts only after both B and C completed.
    let tasks = engine
        .get_workflow_results(&workflow_id)
        .await
        .unwrap();
    let d_started = tasks["d"].started_at.unwrap();
    assert!(d_started >= tasks["b"].completed_at.unwrap());
    assert!(d_started >= tasks["c"].completed_at.unwrap());

    engine.stop().await;
}

/// Scenario: two retryable failures, then success, with measured backoff.
#[tokio::test]
async fn test_retry_then_succeed() {
    let engine =
        engine_with_echo(Arc::new(MemoryStorage::new()), EchoProvider::flaky("echo-1", 2)).await;
    let mut events = engine.subscribe();

    let mut workflow = Workflow::new("retry-then-succeed");
    workflow.add_task(
        task("flaky", "echo/fail", serde_json::json!({}), &[]).with_retry(RetryConfig {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: false,
        }),
    );

    let started = Instant::now();
    let workflow_id = engine.submit(workflow).await.unwrap();
    let status = engine.wait_for_workflow(&workflow_id, WAIT).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(status, WorkflowStatus::Completed);

    let results = engine.get_workflow_results(&workflow_id).await.unwrap();
    assert_eq!(results["flaky"].attempt, 3);
    assert_eq!(results["flaky"].result, serde_json::json!({"ok": true}));

    // Two backoff delays: 100ms then 200ms.
    assert!(
        elapsed >= Duration::from_millis(300),
        "elapsed only {:?}",
        elapsed
    );

    let mut retry_events = 0;
    while let Some(event) = events.try_next() {
        if matches!(event, EngineEvent::TaskRetrying { .. }) {
            retry_events += 1;
        }
    }
    assert_eq!(retry_events, 2);

    engine.stop().await;
}

/// Scenario: circular dependencies are rejected at submission and nothing
/// is persisted.
#[tokio::test]
async fn test_circular_dependency_rejected() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_with_echo(storage.clone(), EchoProvider::new("echo-1")).await;

    let mut workflow = Workflow::new("cyclic");
    workflow.add_task(task("a", "echo/ping", serde_json::json!({}), &["b"]));
    workflow.add_task(task("b", "echo/ping", serde_json::json!({}), &["a"]));
    let workflow_id = workflow.id.clone();

    let err = engine.submit(workflow).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("Circular dependency"));

    // Nothing was persisted or queued.
    assert!(storage.get_workflow(&workflow_id).await.unwrap().is_none());
    assert_eq!(engine.queue_stats().total_enqueued, 0);

    engine.stop().await;
}

/// Scenario: non-retryable failure fails the workflow and cancels
/// dependents without invoking them.
#[tokio::test]
async fn test_fail_fast_cascade() {
    let engine = engine_with_echo(Arc::new(MemoryStorage::new()), EchoProvider::new("echo-1")).await;

    let mut workflow = Workflow::new("fail-fast");
    workflow.add_task(task(
        "a",
        "echo/fail",
        serde_json::json!({"kind": "invalid_params"}),
        &[],
    ));
    workflow.add_task(task("b", "echo/ping", serde_json::json!({}), &["a"]));
    workflow.add_task(task("c", "echo/ping", serde_json::json!({}), &["a"]));

    let workflow_id = engine.submit(workflow).await.unwrap();
    let status = engine.wait_for_workflow(&workflow_id, WAIT).await.unwrap();
    assert_eq!(status, WorkflowStatus::Failed);

    let report = engine.get_workflow_status(&workflow_id).await.unwrap();
    let by_id: std::collections::HashMap<&str, &gleitzeit_engine::TaskStatusEntry> = report
        .tasks
        .iter()
        .map(|t| (t.task_id.as_str(), t))
        .collect();

    assert_eq!(by_id["a"].status, TaskStatus::Failed);
    // A single non-retryable failure: exactly one attempt.
    assert_eq!(by_id["a"].attempt, 1);
    assert_eq!(by_id["b"].status, TaskStatus::Cancelled);
    assert_eq!(by_id["c"].status, TaskStatus::Cancelled);
    // b and c were never dispatched.
    assert_eq!(by_id["b"].attempt, 0);
    assert_eq!(by_id["c"].attempt, 0);

    engine.stop().await;
}

/// Scenario: the engine dies mid-execution; a fresh engine over the same
/// storage redelivers the interrupted task and it completes exactly once.
#[tokio::test]
async fn test_crash_recovery() {
    let storage: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());

    let mut workflow = Workflow::new("crash-recovery");
    workflow.add_task(task("a", "echo/delay", serde_json::json!({"seconds": 2.0}), &[]));
    let workflow_id = workflow.id.clone();

    // First engine reserves and starts the task, then dies.
    {
        let engine = engine_with_echo(storage.clone(), EchoProvider::new("echo-1")).await;
        engine.submit(workflow).await.unwrap();

        let deadline = Instant::now() + WAIT;
        loop {
            let report = engine.get_workflow_status(&workflow_id).await.unwrap();
            if report.tasks[0].status == TaskStatus::Executing {
                break;
            }
            assert!(Instant::now() < deadline, "task never started executing");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        engine.stop().await;
    }

    // Second engine recovers the interrupted attempt.
    let engine = engine_with_echo(
        storage.clone() as Arc<dyn StorageBackend>,
        EchoProvider::new("echo-2"),
    )
    .await;

    let status = engine.wait_for_workflow(&workflow_id, WAIT).await.unwrap();
    assert_eq!(status, WorkflowStatus::Completed);

    // Exactly one persisted successful result, produced by the retry of
    // the interrupted attempt.
    let results = engine.get_workflow_results(&workflow_id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results["a"].status, TaskStatus::Completed);
    assert_eq!(results["a"].attempt, 2);

    engine.stop().await;
}

/// A task-level timeout produces a retryable failure; with one attempt it
/// fails the task terminally.
#[tokio::test]
async fn test_timeout_fails_task() {
    let engine = engine_with_echo(Arc::new(MemoryStorage::new()), EchoProvider::new("echo-1")).await;

    let mut workflow = Workflow::new("timeout");
    let mut slow = task("slow", "echo/delay", serde_json::json!({"seconds": 5.0}), &[])
        .with_retry(RetryConfig::none());
    slow.timeout_seconds = Some(1);
    workflow.add_task(slow);

    let workflow_id = engine.submit(workflow).await.unwrap();
    let status = engine.wait_for_workflow(&workflow_id, WAIT).await.unwrap();
    assert_eq!(status, WorkflowStatus::Failed);

    let results = engine.get_workflow_results(&workflow_id).await.unwrap();
    assert_eq!(results["slow"].status, TaskStatus::Failed);
    assert!(results["slow"].error.as_ref().unwrap().contains("Timeout"));

    engine.stop().await;
}

/// Cancelling a running workflow stops in-flight work.
#[tokio::test]
async fn test_cancel_workflow() {
    let engine = engine_with_echo(Arc::new(MemoryStorage::new()), EchoProvider::new("echo-1")).await;

    let mut workflow = Workflow::new("cancel-me");
    workflow.add_task(task("slow", "echo/delay", serde_json::json!({"seconds": 8.0}), &[]));
    workflow.add_task(task("after", "echo/ping", serde_json::json!({}), &["slow"]));

    let workflow_id = engine.submit(workflow).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(engine.cancel_workflow(&workflow_id, false).await.unwrap());
    let status = engine.wait_for_workflow(&workflow_id, WAIT).await.unwrap();
    assert_eq!(status, WorkflowStatus::Cancelled);

    // The in-flight task is marked cancelled once its worker observes the
    // signal and returns.
    let deadline = Instant::now() + WAIT;
    loop {
        let report = engine.get_workflow_status(&workflow_id).await.unwrap();
        if report.tasks.iter().all(|t| t.status == TaskStatus::Cancelled) {
            break;
        }
        assert!(Instant::now() < deadline, "tasks never settled: {:?}", report.tasks);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Cancellation is idempotent.
    assert!(engine.cancel_workflow(&workflow_id, true).await.unwrap());

    engine.stop().await;
}

/// Higher-priority workflows are served first by the queue.
#[tokio::test]
async fn test_priority_precedence() {
    let config = EngineConfig {
        workers: 1,
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let engine = ExecutionEngine::new(config, Arc::new(MemoryStorage::new()));
    register_echo(&engine, EchoProvider::new("echo-1"));
    engine.start().await.unwrap();
    let mut events = engine.subscribe();

    // A slow task occupies the single worker while the others queue up.
    let mut blocker = Workflow::new("blocker");
    blocker.add_task(task("hold", "echo/delay", serde_json::json!({"seconds": 0.3}), &[]));
    engine.submit(blocker).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut low = Workflow::new("low");
    low.add_task(task("low-task", "echo/ping", serde_json::json!({}), &[]).with_priority(Priority::Low));
    let mut urgent = Workflow::new("urgent");
    urgent.add_task(
        task("urgent-task", "echo/ping", serde_json::json!({}), &[]).with_priority(Priority::Urgent),
    );

    let low_id = engine.submit(low).await.unwrap();
    let urgent_id = engine.submit(urgent).await.unwrap();

    engine.wait_for_workflow(&low_id, WAIT).await.unwrap();
    engine.wait_for_workflow(&urgent_id, WAIT).await.unwrap();

    let mut started_order = Vec::new();
    while let Some(event) = events.try_next() {
        if let EngineEvent::TaskStarted { task, .. } = event {
            started_order.push(task.task_id);
        }
    }
    let low_pos = started_order.iter().position(|t| t == "low-task").unwrap();
    let urgent_pos = started_order.iter().position(|t| t == "urgent-task").unwrap();
    assert!(urgent_pos < low_pos, "urgent must start before low: {:?}", started_order);

    engine.stop().await;
}

/// Under continue-on-error, a failed branch cancels only its own
/// dependents; the rest of the workflow still runs.
#[tokio::test]
async fn test_continue_on_error_strategy() {
    let engine = engine_with_echo(Arc::new(MemoryStorage::new()), EchoProvider::new("echo-1")).await;

    let mut workflow = Workflow::new("continue-on-error");
    workflow.error_strategy = ErrorStrategy::ContinueOnError;
    workflow.add_task(task(
        "bad",
        "echo/fail",
        serde_json::json!({"kind": "invalid_params"}),
        &[],
    ));
    workflow.add_task(task("bad-child", "echo/ping", serde_json::json!({}), &["bad"]));
    workflow.add_task(task("good", "echo/ping", serde_json::json!({"message": "ok"}), &[]));
    workflow.add_task(task("good-child", "echo/ping", serde_json::json!({}), &["good"]));

    let workflow_id = engine.submit(workflow).await.unwrap();
    let status = engine.wait_for_workflow(&workflow_id, WAIT).await.unwrap();
    assert_eq!(status, WorkflowStatus::Failed);

    let report = engine.get_workflow_status(&workflow_id).await.unwrap();
    let status_of = |id: &str| report.tasks.iter().find(|t| t.task_id == id).unwrap().status;

    assert_eq!(status_of("bad"), TaskStatus::Failed);
    assert_eq!(status_of("bad-child"), TaskStatus::Cancelled);
    // The independent branch ran to completion.
    assert_eq!(status_of("good"), TaskStatus::Completed);
    assert_eq!(status_of("good-child"), TaskStatus::Completed);

    engine.stop().await;
}

/// Submissions past the queue's depth cap are rejected with backpressure
/// and leave nothing behind.
#[tokio::test]
async fn test_submit_backpressure() {
    let config = EngineConfig {
        workers: 1,
        poll_interval: Duration::from_millis(10),
        queue: QueueConfig { max_depth: 2 },
        ..Default::default()
    };
    let storage = Arc::new(MemoryStorage::new());
    let engine = ExecutionEngine::new(config, storage.clone());
    register_echo(&engine, EchoProvider::new("echo-1"));
    engine.start().await.unwrap();

    // Three independent slow tasks exceed a cap of two.
    let mut workflow = Workflow::new("too-wide");
    for id in ["a", "b", "c"] {
        workflow.add_task(task(id, "echo/delay", serde_json::json!({"seconds": 5.0}), &[]));
    }
    let workflow_id = workflow.id.clone();

    let err = engine.submit(workflow).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backpressure);
    assert!(storage.get_workflow(&workflow_id).await.unwrap().is_none());

    engine.stop().await;
}

/// Task requirements steer provider selection to matching providers.
#[tokio::test]
async fn test_requirements_route_to_tagged_provider() {
    let engine = ExecutionEngine::new(test_config(), Arc::new(MemoryStorage::new()));
    let registry = engine.registry();
    registry
        .register_protocol(EchoProvider::protocol_spec())
        .unwrap();
    registry
        .register_provider(
            ProviderRegistration::new(
                "plain",
                "echo/v1",
                ProviderHandle::Local(Arc::new(EchoProvider::new("plain"))),
                EchoProvider::methods(),
            ),
        )
        .unwrap();
    registry
        .register_provider(
            ProviderRegistration::new(
                "gpu",
                "echo/v1",
                ProviderHandle::Local(Arc::new(EchoProvider::new("gpu"))),
                EchoProvider::methods(),
            )
            .with_tags(vec!["gpu".to_string()]),
        )
        .unwrap();
    engine.start().await.unwrap();

    let mut requirements = TaskRequirements::none();
    requirements.tags.insert("gpu".to_string());

    let mut workflow = Workflow::new("tagged");
    workflow.add_task(
        task("needs-gpu", "echo/ping", serde_json::json!({}), &[]).with_requirements(requirements),
    );

    let workflow_id = engine.submit(workflow).await.unwrap();
    let status = engine.wait_for_workflow(&workflow_id, WAIT).await.unwrap();
    assert_eq!(status, WorkflowStatus::Completed);

    // Only the tagged provider can have served the call.
    let records = engine.list_providers();
    let gpu = records.iter().find(|r| r.provider_id == "gpu").unwrap();
    assert_eq!(gpu.health, gleitzeit_core::ProviderHealth::Healthy);
    let plain = records.iter().find(|r| r.provider_id == "plain").unwrap();
    assert_eq!(plain.health, gleitzeit_core::ProviderHealth::Unknown);

    engine.stop().await;
}

/// Pruning removes a finished workflow's persisted state; running
/// workflows are refused.
#[tokio::test]
async fn test_prune_workflow() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = engine_with_echo(storage.clone(), EchoProvider::new("echo-1")).await;

    let mut done = Workflow::new("done");
    done.add_task(task("a", "echo/ping", serde_json::json!({}), &[]));
    let done_id = engine.submit(done).await.unwrap();
    engine.wait_for_workflow(&done_id, WAIT).await.unwrap();

    let mut running = Workflow::new("running");
    running.add_task(task("slow", "echo/delay", serde_json::json!({"seconds": 8.0}), &[]));
    let running_id = engine.submit(running).await.unwrap();

    // A running workflow cannot be pruned.
    let err = engine.prune_workflow(&running_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    engine.prune_workflow(&done_id).await.unwrap();
    assert!(storage.get_workflow(&done_id).await.unwrap().is_none());
    let err = engine.get_workflow_status(&done_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    engine.cancel_workflow(&running_id, true).await.unwrap();
    engine.stop().await;
}

/// Submission documents drive the same engine paths as built workflows.
#[tokio::test]
async fn test_submit_yaml_document() {
    let engine = engine_with_echo(Arc::new(MemoryStorage::new()), EchoProvider::new("echo-1")).await;

    let document = gleitzeit_core::WorkflowDocument::from_yaml(
        r#"
name: from-yaml
priority: high
tasks:
  - id: ping
    name: ping
    protocol: echo/v1
    method: echo/ping
    params:
      message: from a document
  - id: echo
    name: echo
    protocol: echo/v1
    method: echo/echo
    dependencies: [ping]
    params:
      value: "${ping.response}"
"#,
    )
    .unwrap();

    let workflow_id = engine.submit_workflow(document).await.unwrap();
    let status = engine.wait_for_workflow(&workflow_id, WAIT).await.unwrap();
    assert_eq!(status, WorkflowStatus::Completed);

    let results = engine.get_workflow_results(&workflow_id).await.unwrap();
    assert_eq!(
        results["echo"].result,
        serde_json::json!({"echoed": "from a document"})
    );

    // Listing includes the workflow.
    let page = engine.list_workflows(10, None).await.unwrap();
    assert!(page.workflows.iter().any(|w| w.id == workflow_id));

    engine.stop().await;
}
