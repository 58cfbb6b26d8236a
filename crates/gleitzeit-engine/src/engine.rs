//! The execution engine: accepts workflows, drives tasks through the
//! state machine, invokes providers, and records results.

use chrono::Utc;
use gleitzeit_core::{
    ErrorKind, InvocationError, InvocationRequest, Task, TaskRef, TaskResult, TaskStatus,
    Workflow, WorkflowDocument, WorkflowId, WorkflowStatus,
};
use gleitzeit_queue::{QueueConfig, QueueError, QueueStats, QueuedEntry, TaskQueue};
use gleitzeit_registry::{
    HealthConfig, ProviderRecord, ProviderRegistry, RegistryError, SelectionRequirements,
};
use gleitzeit_storage::{StatusUpdate, StorageBackend, StorageError, WorkflowPage};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus, Subscription};
use crate::resolver::DependencyResolver;
use crate::timer::{TimerEvent, TimerService};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of parallel worker loops.
    pub workers: usize,

    /// Execution deadline for tasks that set none.
    pub default_task_timeout: Duration,

    /// Added to a task's timeout to form its reservation visibility, so
    /// only crashes trigger redelivery.
    pub visibility_margin: Duration,

    /// How long an idle worker waits before re-polling the queue.
    pub poll_interval: Duration,

    /// How many times provider selection is retried before the task fails
    /// retryably.
    pub selection_retries: u32,

    /// Pause between provider selection retries.
    pub selection_backoff: Duration,

    /// Queue configuration.
    pub queue: QueueConfig,

    /// Provider health configuration.
    pub health: HealthConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_task_timeout: Duration::from_secs(300),
            visibility_margin: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            selection_retries: 3,
            selection_backoff: Duration::from_millis(100),
            queue: QueueConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

/// Per-task row in a workflow status report.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusEntry {
    /// Task id.
    pub task_id: String,
    /// Task name.
    pub name: String,
    /// Current status.
    pub status: TaskStatus,
    /// Attempts so far.
    pub attempt: u32,
    /// Error message for terminally failed tasks.
    pub error: Option<String>,
}

/// Snapshot returned by `get_workflow_status`.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatusReport {
    /// Workflow id.
    pub workflow_id: WorkflowId,
    /// Workflow name.
    pub name: String,
    /// Workflow status.
    pub status: WorkflowStatus,
    /// Task counts by status.
    pub counts: BTreeMap<String, usize>,
    /// Per-task statuses in submission order.
    pub tasks: Vec<TaskStatusEntry>,
}

/// Why an in-flight invocation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelReason {
    /// The attempt's deadline elapsed; retryable.
    Timeout,
    /// The workflow was cancelled.
    Workflow,
}

/// Cancellation plumbing for one executing attempt.
struct ExecutingHandle {
    attempt: u32,
    token: CancellationToken,
    reason: Arc<SyncMutex<Option<CancelReason>>>,
}

/// Outcome a worker reports for one attempt.
#[derive(Debug)]
enum ExecutionOutcome {
    Success(serde_json::Value),
    Failure(InvocationError),
    Cancelled,
}

struct WorkerReport {
    task: TaskRef,
    attempt: u32,
    outcome: ExecutionOutcome,
}

struct EngineInner {
    config: EngineConfig,
    storage: Arc<dyn StorageBackend>,
    registry: Arc<ProviderRegistry>,
    queue: Arc<TaskQueue>,
    resolver: DependencyResolver,
    timer: TimerService,
    events: EventBus,

    /// Serializes every state transition; the engine is one logical actor.
    transition: Mutex<()>,

    /// Cancellation handles for currently executing attempts.
    executing: SyncMutex<HashMap<TaskRef, ExecutingHandle>>,

    report_tx: mpsc::UnboundedSender<WorkerReport>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

/// The orchestration engine.
///
/// Owns the persistence port, the provider registry, the task queue, the
/// dependency resolver, and the retry/timeout timer; drives every task
/// through the state machine with a pool of worker loops.
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
    report_rx: SyncMutex<Option<mpsc::UnboundedReceiver<WorkerReport>>>,
    handles: SyncMutex<Vec<JoinHandle<()>>>,
}

impl ExecutionEngine {
    /// Creates an engine over the given storage backend.
    pub fn new(config: EngineConfig, storage: Arc<dyn StorageBackend>) -> Self {
        let registry = Arc::new(ProviderRegistry::new(config.health.clone()));
        Self::with_registry(config, storage, registry)
    }

    /// Creates an engine sharing an externally built registry.
    pub fn with_registry(
        config: EngineConfig,
        storage: Arc<dyn StorageBackend>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(TaskQueue::new(config.queue.clone()));

        let inner = Arc::new(EngineInner {
            config,
            storage,
            registry,
            queue,
            resolver: DependencyResolver::new(),
            timer: TimerService::new(),
            events: EventBus::new(),
            transition: Mutex::new(()),
            executing: SyncMutex::new(HashMap::new()),
            report_tx,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        });

        Self {
            inner,
            report_rx: SyncMutex::new(Some(report_rx)),
            handles: SyncMutex::new(Vec::new()),
        }
    }

    /// The provider registry, for protocol/provider registration.
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.inner.registry
    }

    /// Subscribes to engine lifecycle events.
    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    /// Queue counters.
    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// Starts the engine: initializes storage, recovers persisted state,
    /// and spawns the timer, event loop, and worker pool. Idempotent.
    pub async fn start(&self) -> EngineResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.storage.initialize().await?;
        EngineInner::recover(&self.inner).await?;

        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let report_rx = self
            .report_rx
            .lock()
            .take()
            .expect("engine started with no report receiver");

        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(
            self.inner
                .timer
                .clone()
                .run(timer_tx, self.inner.shutdown.clone()),
        ));
        handles.push(tokio::spawn(EngineInner::run_event_loop(
            Arc::clone(&self.inner),
            report_rx,
            timer_rx,
        )));
        for worker in 0..self.inner.config.workers.max(1) {
            handles.push(tokio::spawn(EngineInner::run_worker(
                Arc::clone(&self.inner),
                worker,
            )));
        }

        // Recurring provider health probes.
        for provider_id in self.inner.registry.provider_ids() {
            self.inner.timer.schedule(
                self.inner.config.health.probe_interval,
                TimerEvent::ProviderHealthProbe(provider_id),
            );
        }

        info!(
            "engine started ({} workers, queue cap {})",
            self.inner.config.workers, self.inner.config.queue.max_depth
        );
        Ok(())
    }

    /// Stops every loop without waiting for in-flight work. Interrupted
    /// attempts are redelivered on the next start via recovery.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
        if let Err(err) = self.inner.storage.shutdown().await {
            warn!("storage shutdown failed: {}", err);
        }
        info!("engine stopped");
    }

    /// Validates and accepts a workflow document.
    ///
    /// On success the workflow and its tasks are persisted, the DAG is
    /// registered, and initially-ready tasks are enqueued. Validation and
    /// backpressure errors leave no state behind.
    pub async fn submit_workflow(&self, document: WorkflowDocument) -> EngineResult<WorkflowId> {
        let workflow = document.into_workflow()?;
        self.submit(workflow).await
    }

    /// Accepts an already-built workflow (test and API entry point).
    pub async fn submit(&self, workflow: Workflow) -> EngineResult<WorkflowId> {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;

        workflow.validate()?;

        let initial_ready = workflow
            .tasks
            .iter()
            .filter(|t| t.dependencies.is_empty())
            .count();
        let cap = inner.config.queue.max_depth;
        let depth = inner.queue.len();
        if cap > 0 && depth + initial_ready > cap {
            return Err(EngineError::Queue(QueueError::Backpressure { depth, cap }));
        }

        inner.resolver.add_workflow(&workflow)?;

        let mut workflow = workflow;
        with_storage_retry("save_workflow", || inner.storage.save_workflow(&workflow)).await?;
        for task in &workflow.tasks {
            with_storage_retry("save_task", || inner.storage.save_task(task)).await?;
        }

        info!(
            "accepted workflow {} ({}, {} tasks)",
            workflow.id,
            workflow.name,
            workflow.tasks.len()
        );
        inner.events.publish(EngineEvent::WorkflowSubmitted {
            workflow_id: workflow.id.clone(),
        });

        EngineInner::release_ready(inner, &workflow).await?;

        workflow.update_status(WorkflowStatus::Running);
        with_storage_retry("save_workflow", || inner.storage.save_workflow(&workflow)).await?;
        inner.events.publish(EngineEvent::WorkflowStarted {
            workflow_id: workflow.id.clone(),
        });

        Ok(workflow.id)
    }

    /// Cancels a workflow.
    ///
    /// No new tasks start; queued tasks leave the queue; executing tasks
    /// receive an in-flight cancellation signal and are marked cancelled
    /// on return — immediately with `force`, which discards any late
    /// result. Idempotent: cancelling a cancelled workflow returns `true`,
    /// cancelling a completed or failed one returns `false`.
    pub async fn cancel_workflow(&self, workflow_id: &str, force: bool) -> EngineResult<bool> {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;

        let mut workflow = inner
            .storage
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))?;

        match workflow.status {
            WorkflowStatus::Cancelled => return Ok(true),
            status if status.is_terminal() => return Ok(false),
            _ => {}
        }

        workflow.update_status(WorkflowStatus::Cancelled);
        with_storage_retry("save_workflow", || inner.storage.save_workflow(&workflow)).await?;

        let tasks = inner.storage.get_tasks_by_workflow(workflow_id).await?;
        for task in tasks.iter().filter(|t| !t.status.is_terminal()) {
            let task_ref = TaskRef::from(task);
            inner.queue.remove(&task_ref);

            if task.status == TaskStatus::Executing {
                EngineInner::signal_cancel(inner, &task_ref, CancelReason::Workflow);
                if !force {
                    // Marked cancelled when the worker reports back.
                    continue;
                }
            }

            EngineInner::mark_cancelled(inner, &task_ref).await;
        }

        inner.resolver.remove_workflow(workflow_id);
        inner.events.publish(EngineEvent::WorkflowCancelled {
            workflow_id: workflow_id.to_string(),
        });
        info!("cancelled workflow {} (force={})", workflow_id, force);
        Ok(true)
    }

    /// Status snapshot of one workflow.
    pub async fn get_workflow_status(
        &self,
        workflow_id: &str,
    ) -> EngineResult<WorkflowStatusReport> {
        let inner = &self.inner;
        let workflow = inner
            .storage
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))?;

        let rows: HashMap<String, Task> = inner
            .storage
            .get_tasks_by_workflow(workflow_id)
            .await?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        let results = inner.storage.get_workflow_results(workflow_id).await?;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut tasks = Vec::with_capacity(workflow.tasks.len());
        for task in &workflow.tasks {
            let row = rows.get(&task.id).unwrap_or(task);
            *counts.entry(row.status.to_string()).or_insert(0) += 1;
            tasks.push(TaskStatusEntry {
                task_id: row.id.clone(),
                name: row.name.clone(),
                status: row.status,
                attempt: row.attempt,
                error: results.get(&row.id).and_then(|r| r.error.clone()),
            });
        }

        Ok(WorkflowStatusReport {
            workflow_id: workflow.id.clone(),
            name: workflow.name.clone(),
            status: workflow.status,
            counts,
            tasks,
        })
    }

    /// All persisted results of one workflow, keyed by task id.
    pub async fn get_workflow_results(
        &self,
        workflow_id: &str,
    ) -> EngineResult<HashMap<String, TaskResult>> {
        let inner = &self.inner;
        if inner.storage.get_workflow(workflow_id).await?.is_none() {
            return Err(EngineError::NotFound(format!("workflow {}", workflow_id)));
        }
        Ok(inner.storage.get_workflow_results(workflow_id).await?)
    }

    /// Prunes a terminal workflow: deletes its row, task rows, and
    /// results from storage. Running workflows are refused.
    pub async fn prune_workflow(&self, workflow_id: &str) -> EngineResult<()> {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;

        let workflow = inner
            .storage
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))?;
        if !workflow.status.is_terminal() {
            return Err(EngineError::Core(gleitzeit_core::CoreError::Validation(
                format!("workflow {} is still {}", workflow_id, workflow.status),
            )));
        }

        inner.storage.delete_workflow(workflow_id).await?;
        inner.resolver.remove_workflow(workflow_id);
        info!("pruned workflow {}", workflow_id);
        Ok(())
    }

    /// Pages through workflow summaries.
    pub async fn list_workflows(
        &self,
        limit: usize,
        cursor: Option<String>,
    ) -> EngineResult<WorkflowPage> {
        Ok(self.inner.storage.list_workflows(limit, cursor).await?)
    }

    /// Snapshot of every registered provider.
    pub fn list_providers(&self) -> Vec<ProviderRecord> {
        self.inner.registry.list_providers()
    }

    /// Polls until the workflow reaches a terminal status.
    pub async fn wait_for_workflow(
        &self,
        workflow_id: &str,
        timeout: Duration,
    ) -> EngineResult<WorkflowStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let workflow = self
                .inner
                .storage
                .get_workflow(workflow_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))?;
            if workflow.status.is_terminal() {
                return Ok(workflow.status);
            }
            if Instant::now() >= deadline {
                return Err(EngineError::WaitTimeout(format!(
                    "workflow {}",
                    workflow_id
                )));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

impl EngineInner {
    /// Visibility for a task's reservation: its timeout plus the margin.
    fn visibility_for(&self, task: &Task) -> Duration {
        task.timeout().unwrap_or(self.config.default_task_timeout) + self.config.visibility_margin
    }

    /// Transitions a task into the queue (from pending or retrying) and
    /// enqueues it. Caller holds the transition lock.
    async fn enqueue_task(inner: &Arc<EngineInner>, task: &Task) -> EngineResult<()> {
        let task_ref = TaskRef::from(task);

        if task.status != TaskStatus::Queued {
            with_storage_retry("update_task_status", || {
                inner
                    .storage
                    .update_task_status(&task_ref, TaskStatus::Queued, StatusUpdate::none())
            })
            .await?;
        }

        let entry = QueuedEntry::new(task_ref.clone(), task.priority)
            .with_visibility(inner.visibility_for(task));
        match inner.queue.enqueue(entry) {
            Ok(_) => {
                inner
                    .events
                    .publish(EngineEvent::TaskQueued { task: task_ref });
                Ok(())
            }
            Err(QueueError::Backpressure { .. }) => {
                // An accepted task is never dropped: try again shortly.
                warn!("queue full, delaying enqueue of {}", task_ref);
                inner
                    .timer
                    .schedule(Duration::from_secs(1), TimerEvent::TaskRetryDue(task_ref));
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Enqueues every ready task of a workflow, in submission order.
    /// Caller holds the transition lock.
    async fn release_ready(inner: &Arc<EngineInner>, workflow: &Workflow) -> EngineResult<()> {
        let ready = inner.resolver.take_ready(&workflow.id);
        for task in workflow.tasks.iter().filter(|t| ready.contains(&t.id)) {
            let row = inner
                .storage
                .get_task(&TaskRef::from(task))
                .await?
                .unwrap_or_else(|| task.clone());
            Self::enqueue_task(inner, &row).await?;
        }
        Ok(())
    }

    /// Registers a cancellation reason and fires the token for an
    /// executing attempt.
    fn signal_cancel(inner: &Arc<EngineInner>, task_ref: &TaskRef, reason: CancelReason) {
        let executing = inner.executing.lock();
        if let Some(handle) = executing.get(task_ref) {
            *handle.reason.lock() = Some(reason);
            handle.token.cancel();
        }
    }

    /// Fires the token for an executing attempt only if it is still on
    /// the given attempt (the timeout guard).
    fn signal_timeout(inner: &Arc<EngineInner>, task_ref: &TaskRef, attempt: u32) {
        let executing = inner.executing.lock();
        if let Some(handle) = executing.get(task_ref) {
            if handle.attempt == attempt {
                *handle.reason.lock() = Some(CancelReason::Timeout);
                handle.token.cancel();
            } else {
                debug!(
                    "stale timeout for {} (attempt {} != {})",
                    task_ref, attempt, handle.attempt
                );
            }
        }
    }

    /// Persists a cancellation for a non-terminal task. Caller holds the
    /// transition lock.
    async fn mark_cancelled(inner: &Arc<EngineInner>, task_ref: &TaskRef) {
        match inner
            .storage
            .update_task_status(task_ref, TaskStatus::Cancelled, StatusUpdate::finished())
            .await
        {
            Ok(()) => {
                inner.resolver.on_task_cancelled(task_ref);
                inner.events.publish(EngineEvent::TaskCancelled {
                    task: task_ref.clone(),
                });
            }
            Err(StorageError::InvalidTransition { .. }) => {
                // Already terminal; nothing to do.
            }
            Err(err) => warn!("failed to cancel {}: {}", task_ref, err),
        }
    }

    /// Worker loop: reserve, execute, report, repeat.
    async fn run_worker(inner: Arc<EngineInner>, worker: usize) {
        debug!("worker {} started", worker);
        loop {
            let reserved = tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                entry = inner.queue.reserve_one(
                    inner.config.default_task_timeout + inner.config.visibility_margin,
                    inner.config.poll_interval,
                ) => entry,
            };

            if let Some(entry) = reserved {
                Self::process_entry(&inner, entry, worker).await;
            }
        }
        debug!("worker {} stopped", worker);
    }

    /// Drives one reserved queue entry through execution.
    async fn process_entry(inner: &Arc<EngineInner>, entry: QueuedEntry, worker: usize) {
        let task_ref = entry.task.clone();

        // Reserved transition. A task cancelled or completed while queued
        // is dropped here.
        let task = {
            let _guard = inner.transition.lock().await;
            let task = match inner.storage.get_task(&task_ref).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    warn!("reserved unknown task {}", task_ref);
                    let _ = inner.queue.ack(&task_ref);
                    return;
                }
                Err(err) => {
                    warn!("failed to load {}: {}, releasing", task_ref, err);
                    let _ = inner.queue.nack(&task_ref, Duration::ZERO);
                    return;
                }
            };

            if task.status != TaskStatus::Queued {
                debug!("dropping stale reservation of {} ({})", task_ref, task.status);
                let _ = inner.queue.ack(&task_ref);
                return;
            }

            if let Err(err) = inner
                .storage
                .update_task_status(&task_ref, TaskStatus::Reserved, StatusUpdate::none())
                .await
            {
                warn!("failed to reserve {}: {}, releasing", task_ref, err);
                let _ = inner.queue.nack(&task_ref, Duration::ZERO);
                return;
            }
            task
        };

        // Safety net for crashed peers within the process lifetime.
        inner.timer.schedule(
            inner.visibility_for(&task),
            TimerEvent::VisibilityExpired(task_ref.clone()),
        );

        // Executing transition: stamp started_at, advance the attempt,
        // arm the timeout, register the cancellation handle.
        let attempt = task.attempt + 1;
        let token = CancellationToken::new();
        let reason = Arc::new(SyncMutex::new(None));
        {
            let _guard = inner.transition.lock().await;
            let current = match inner.storage.get_task(&task_ref).await {
                Ok(Some(task)) => task,
                _ => {
                    let _ = inner.queue.ack(&task_ref);
                    return;
                }
            };
            if current.status != TaskStatus::Reserved {
                debug!("{} no longer reserved ({})", task_ref, current.status);
                let _ = inner.queue.ack(&task_ref);
                return;
            }

            if let Err(err) = inner
                .storage
                .update_task_status(&task_ref, TaskStatus::Executing, StatusUpdate::started(attempt))
                .await
            {
                warn!("failed to start {}: {}", task_ref, err);
                let _ = inner.queue.nack(&task_ref, Duration::ZERO);
                return;
            }

            inner.executing.lock().insert(
                task_ref.clone(),
                ExecutingHandle {
                    attempt,
                    token: token.clone(),
                    reason: Arc::clone(&reason),
                },
            );
            inner.events.publish(EngineEvent::TaskStarted {
                task: task_ref.clone(),
                attempt,
            });
        }

        let timeout = task.timeout().unwrap_or(inner.config.default_task_timeout);
        inner.timer.schedule(
            timeout,
            TimerEvent::TaskTimeout {
                task: task_ref.clone(),
                attempt,
            },
        );

        debug!(
            "worker {} executing {} attempt {} ({} {})",
            worker, task_ref, attempt, task.protocol, task.method
        );
        let outcome = Self::execute_attempt(inner, &task, timeout, &token, &reason).await;

        inner.executing.lock().remove(&task_ref);
        let _ = inner.report_tx.send(WorkerReport {
            task: task_ref,
            attempt,
            outcome,
        });
    }

    /// Resolves parameters, selects a provider, and invokes it once.
    async fn execute_attempt(
        inner: &Arc<EngineInner>,
        task: &Task,
        timeout: Duration,
        token: &CancellationToken,
        reason: &Arc<SyncMutex<Option<CancelReason>>>,
    ) -> ExecutionOutcome {
        // Parameter substitution: a pure function of params and prior
        // results; failures are validation errors, never retried.
        let results = match inner.storage.get_workflow_results(&task.workflow_id).await {
            Ok(results) => results,
            Err(err) => {
                return ExecutionOutcome::Failure(InvocationError::new(
                    ErrorKind::Transport,
                    format!("failed to load prior results: {}", err),
                ));
            }
        };
        let params = match inner.resolver.resolve_params(task, &results) {
            Ok(params) => params,
            Err(err) => {
                return ExecutionOutcome::Failure(InvocationError::new(
                    ErrorKind::Validation,
                    err.to_string(),
                ));
            }
        };

        // Provider selection, retried within a bounded window.
        let requirements = SelectionRequirements::from(&task.requirements);
        let mut selected = None;
        for round in 0..=inner.config.selection_retries {
            match inner
                .registry
                .select_provider(&task.protocol, &task.method, &requirements)
            {
                Ok(pick) => {
                    selected = Some(pick);
                    break;
                }
                Err(RegistryError::NoProviderAvailable { .. })
                    if round < inner.config.selection_retries =>
                {
                    tokio::time::sleep(inner.config.selection_backoff).await;
                }
                Err(err) => {
                    return ExecutionOutcome::Failure(InvocationError::new(
                        err.kind(),
                        err.to_string(),
                    ));
                }
            }
        }
        let Some((provider_id, handle)) = selected else {
            return ExecutionOutcome::Failure(InvocationError::new(
                ErrorKind::ProviderUnavailable,
                format!("no provider available for {} {}", task.protocol, task.method),
            ));
        };

        let deadline = Utc::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(300));
        let request = InvocationRequest::new(task.method.clone(), params, deadline);

        inner.registry.acquire_slot(&provider_id);
        let started = Instant::now();
        let ended = tokio::select! {
            response = inner.registry.invoke(&handle, request) => Some(response),
            _ = token.cancelled() => None,
            _ = tokio::time::sleep(timeout) => {
                debug!("local deadline elapsed for {}", task.id);
                Some(gleitzeit_core::InvocationResponse::failure(
                    String::new(),
                    InvocationError::new(ErrorKind::Timeout, "deadline exceeded"),
                ))
            }
        };
        inner.registry.release_slot(&provider_id);

        match ended {
            Some(response) => match response.into_result() {
                Ok(value) => {
                    inner.registry.record_success(&provider_id, started.elapsed());
                    ExecutionOutcome::Success(value)
                }
                Err(error) => {
                    inner.registry.record_failure(&provider_id, error.kind());
                    ExecutionOutcome::Failure(error)
                }
            },
            None => {
                let why = reason.lock().take();
                match why {
                    Some(CancelReason::Timeout) => {
                        inner.registry.record_failure(&provider_id, ErrorKind::Timeout);
                        ExecutionOutcome::Failure(InvocationError::new(
                            ErrorKind::Timeout,
                            "deadline exceeded",
                        ))
                    }
                    Some(CancelReason::Workflow) | None => ExecutionOutcome::Cancelled,
                }
            }
        }
    }

    /// Event loop: applies worker outcomes and timer events, one at a
    /// time, under the transition lock.
    async fn run_event_loop(
        inner: Arc<EngineInner>,
        mut report_rx: mpsc::UnboundedReceiver<WorkerReport>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    ) {
        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                report = report_rx.recv() => match report {
                    Some(report) => {
                        if let Err(err) = Self::handle_report(&inner, report).await {
                            error!("failed to apply task outcome: {}", err);
                        }
                    }
                    None => break,
                },
                event = timer_rx.recv() => match event {
                    Some(event) => {
                        if let Err(err) = Self::handle_timer_event(&inner, event).await {
                            error!("failed to apply timer event: {}", err);
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("event loop stopped");
    }

    /// Applies one worker outcome.
    async fn handle_report(inner: &Arc<EngineInner>, report: WorkerReport) -> EngineResult<()> {
        let _guard = inner.transition.lock().await;
        let task_ref = report.task.clone();

        let Some(task) = inner.storage.get_task(&task_ref).await? else {
            debug!("outcome for unknown task {}", task_ref);
            return Ok(());
        };

        // Idempotent completion: a stale or duplicate {task, attempt}
        // outcome is dropped.
        if task.status != TaskStatus::Executing || task.attempt != report.attempt {
            debug!(
                "dropping stale outcome for {} (status {}, attempt {} vs {})",
                task_ref, task.status, task.attempt, report.attempt
            );
            let _ = inner.queue.ack(&task_ref);
            return Ok(());
        }

        // The reservation is done regardless of the outcome; redelivery
        // from here on is the retry path, not visibility expiry.
        let _ = inner.queue.ack(&task_ref);

        match report.outcome {
            ExecutionOutcome::Success(value) => {
                let result = TaskResult::success(&task, value);
                with_storage_retry("save_task_result", || {
                    inner.storage.save_task_result(&result)
                })
                .await?;
                with_storage_retry("update_task_status", || {
                    inner.storage.update_task_status(
                        &task_ref,
                        TaskStatus::Completed,
                        StatusUpdate::finished(),
                    )
                })
                .await?;

                info!("task {} completed (attempt {})", task_ref, report.attempt);
                inner.events.publish(EngineEvent::TaskCompleted {
                    task: task_ref.clone(),
                    attempt: report.attempt,
                });

                let newly_ready = inner.resolver.on_task_completed(&task_ref);
                if !newly_ready.is_empty() {
                    for task_id in &newly_ready {
                        let dep_ref = TaskRef::new(task_ref.workflow_id.clone(), task_id.clone());
                        if let Some(row) = inner.storage.get_task(&dep_ref).await? {
                            Self::enqueue_task(inner, &row).await?;
                        }
                    }
                }

                Self::check_workflow(inner, &task_ref.workflow_id).await?;
            }

            ExecutionOutcome::Failure(error) => {
                let retryable = error.is_retryable();
                if retryable && report.attempt < task.retry.max_attempts {
                    let delay = task
                        .retry
                        .delay_after_attempt(report.attempt)
                        .unwrap_or_else(|| Duration::from_millis(task.retry.base_delay_ms));

                    with_storage_retry("update_task_status", || {
                        inner.storage.update_task_status(
                            &task_ref,
                            TaskStatus::Retrying,
                            StatusUpdate::none(),
                        )
                    })
                    .await?;

                    warn!(
                        "task {} failed retryably (attempt {}/{}), retrying in {:?}: {}",
                        task_ref, report.attempt, task.retry.max_attempts, delay, error
                    );
                    inner.events.publish(EngineEvent::TaskRetrying {
                        task: task_ref.clone(),
                        attempt: report.attempt,
                        delay_ms: delay.as_millis() as u64,
                    });
                    inner
                        .timer
                        .schedule(delay, TimerEvent::TaskRetryDue(task_ref));
                } else {
                    Self::fail_task(inner, &task, error).await?;
                    Self::check_workflow(inner, &task_ref.workflow_id).await?;
                }
            }

            ExecutionOutcome::Cancelled => {
                info!("task {} cancelled in flight", task_ref);
                Self::mark_cancelled(inner, &task_ref).await;
                Self::check_workflow(inner, &task_ref.workflow_id).await?;
            }
        }

        Ok(())
    }

    /// Records a terminal failure and cancels the failed task's live
    /// transitive dependents.
    async fn fail_task(
        inner: &Arc<EngineInner>,
        task: &Task,
        error: InvocationError,
    ) -> EngineResult<()> {
        let task_ref = TaskRef::from(task);
        let message = format!(
            "task {} failed after {} attempt(s) [{:?}]: {}",
            task.id,
            task.attempt,
            error.kind(),
            error.message
        );

        let result = TaskResult::failure(task, message.clone());
        with_storage_retry("save_task_result", || inner.storage.save_task_result(&result)).await?;
        with_storage_retry("update_task_status", || {
            inner
                .storage
                .update_task_status(&task_ref, TaskStatus::Failed, StatusUpdate::finished())
        })
        .await?;

        error!("{}", message);
        inner.events.publish(EngineEvent::TaskFailed {
            task: task_ref.clone(),
            attempt: task.attempt,
            error: message,
        });

        let workflow = inner.storage.get_workflow(&task_ref.workflow_id).await?;
        let strategy = workflow.map(|w| w.error_strategy).unwrap_or_default();

        for task_id in inner.resolver.on_task_failed(&task_ref, strategy) {
            let dep_ref = TaskRef::new(task_ref.workflow_id.clone(), task_id);
            inner.queue.remove(&dep_ref);
            Self::mark_cancelled(inner, &dep_ref).await;
        }
        Ok(())
    }

    /// Applies one timer event.
    async fn handle_timer_event(inner: &Arc<EngineInner>, event: TimerEvent) -> EngineResult<()> {
        match event {
            TimerEvent::TaskRetryDue(task_ref) => {
                let _guard = inner.transition.lock().await;
                let Some(task) = inner.storage.get_task(&task_ref).await? else {
                    return Ok(());
                };
                match task.status {
                    TaskStatus::Retrying | TaskStatus::Pending => {
                        Self::enqueue_task(inner, &task).await?;
                    }
                    other => debug!("stale retry for {} ({})", task_ref, other),
                }
            }

            TimerEvent::TaskTimeout { task, attempt } => {
                // The attempt guard keeps a stale timeout from touching a
                // later attempt; the worker reports the failure.
                Self::signal_timeout(inner, &task, attempt);
            }

            TimerEvent::VisibilityExpired(_task) => {
                let expired = inner.queue.expire_reservations(Instant::now());
                if expired.is_empty() {
                    return Ok(());
                }
                let _guard = inner.transition.lock().await;
                for task_ref in expired {
                    match inner.storage.get_task(&task_ref).await? {
                        Some(task) if task.status == TaskStatus::Reserved => {
                            with_storage_retry("update_task_status", || {
                                inner.storage.update_task_status(
                                    &task_ref,
                                    TaskStatus::Queued,
                                    StatusUpdate::none(),
                                )
                            })
                            .await?;
                            info!("reservation of {} expired, visible again", task_ref);
                        }
                        _ => {}
                    }
                }
            }

            TimerEvent::ProviderHealthProbe(provider_id) => {
                let alive = inner.registry.probe(&provider_id).await;
                debug!("probed provider {}: alive={}", provider_id, alive);
                if inner.registry.get_record(&provider_id).is_some() {
                    inner.timer.schedule(
                        inner.config.health.probe_interval,
                        TimerEvent::ProviderHealthProbe(provider_id),
                    );
                }
            }
        }
        Ok(())
    }

    /// Re-evaluates a workflow after a terminal task transition.
    async fn check_workflow(inner: &Arc<EngineInner>, workflow_id: &str) -> EngineResult<()> {
        let Some(mut workflow) = inner.storage.get_workflow(workflow_id).await? else {
            return Ok(());
        };
        if workflow.status.is_terminal() {
            return Ok(());
        }

        let tasks = inner.storage.get_tasks_by_workflow(workflow_id).await?;
        let all_terminal = tasks.iter().all(|t| t.status.is_terminal());
        let any_failed = tasks.iter().any(|t| t.status == TaskStatus::Failed);
        let all_completed = tasks.iter().all(|t| t.status == TaskStatus::Completed);

        if all_completed {
            workflow.update_status(WorkflowStatus::Completed);
            with_storage_retry("save_workflow", || inner.storage.save_workflow(&workflow)).await?;
            inner.resolver.remove_workflow(workflow_id);
            info!("workflow {} completed", workflow_id);
            inner.events.publish(EngineEvent::WorkflowCompleted {
                workflow_id: workflow_id.to_string(),
            });
            return Ok(());
        }

        if any_failed {
            let fail_now = match workflow.error_strategy {
                gleitzeit_core::ErrorStrategy::FailFast => true,
                gleitzeit_core::ErrorStrategy::ContinueOnError => all_terminal,
            };
            if fail_now {
                workflow.update_status(WorkflowStatus::Failed);
                with_storage_retry("save_workflow", || inner.storage.save_workflow(&workflow))
                    .await?;

                // Fail-fast: remaining non-terminal tasks are cancelled;
                // executing ones get the in-flight signal.
                for task in tasks.iter().filter(|t| !t.status.is_terminal()) {
                    let task_ref = TaskRef::from(task);
                    inner.queue.remove(&task_ref);
                    if task.status == TaskStatus::Executing {
                        Self::signal_cancel(inner, &task_ref, CancelReason::Workflow);
                    } else {
                        Self::mark_cancelled(inner, &task_ref).await;
                    }
                }

                inner.resolver.remove_workflow(workflow_id);
                warn!("workflow {} failed", workflow_id);
                inner.events.publish(EngineEvent::WorkflowFailed {
                    workflow_id: workflow_id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Rebuilds in-memory state from storage after a restart.
    ///
    /// Running workflows are re-registered with the resolver (completed
    /// tasks replayed), and interrupted work — queued, reserved past its
    /// visibility, executing, or retrying rows — is re-enqueued. Completed
    /// results are untouched, so a task that finished before the crash is
    /// never re-run.
    async fn recover(inner: &Arc<EngineInner>) -> EngineResult<()> {
        let _guard = inner.transition.lock().await;
        let mut cursor = None;
        let mut recovered = 0usize;

        loop {
            let page = inner.storage.list_workflows(500, cursor.clone()).await?;
            for summary in &page.workflows {
                if summary.status.is_terminal() {
                    continue;
                }
                Self::recover_workflow(inner, &summary.id).await?;
                recovered += 1;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if recovered > 0 {
            info!("recovered {} in-flight workflow(s)", recovered);
        }
        Ok(())
    }

    async fn recover_workflow(inner: &Arc<EngineInner>, workflow_id: &str) -> EngineResult<()> {
        let Some(workflow) = inner.storage.get_workflow(workflow_id).await? else {
            return Ok(());
        };
        if let Err(err) = inner.resolver.add_workflow(&workflow) {
            // A corrupt stored workflow must not block the rest of
            // recovery.
            error!("skipping unrecoverable workflow {}: {}", workflow_id, err);
            return Ok(());
        }

        let tasks = inner.storage.get_tasks_by_workflow(workflow_id).await?;
        for task in &tasks {
            let task_ref = TaskRef::from(task);
            match task.status {
                TaskStatus::Completed => inner.resolver.replay_completed(&task_ref),
                TaskStatus::Failed => inner.resolver.replay_terminal(&task_ref, true),
                TaskStatus::Cancelled => inner.resolver.replay_terminal(&task_ref, false),

                TaskStatus::Queued => {
                    inner.resolver.replay_released(&task_ref);
                    Self::enqueue_task(inner, task).await?;
                }

                TaskStatus::Reserved | TaskStatus::Retrying => {
                    // Interrupted reservation or pending retry: visible
                    // again right away.
                    inner.resolver.replay_released(&task_ref);
                    with_storage_retry("update_task_status", || {
                        inner.storage.update_task_status(
                            &task_ref,
                            TaskStatus::Queued,
                            StatusUpdate::none(),
                        )
                    })
                    .await?;
                    let mut row = task.clone();
                    row.status = TaskStatus::Queued;
                    Self::enqueue_task(inner, &row).await?;
                }

                TaskStatus::Executing => {
                    // The attempt was interrupted mid-flight; redeliver.
                    inner.resolver.replay_released(&task_ref);
                    with_storage_retry("update_task_status", || {
                        inner.storage.update_task_status(
                            &task_ref,
                            TaskStatus::Retrying,
                            StatusUpdate::none(),
                        )
                    })
                    .await?;
                    with_storage_retry("update_task_status", || {
                        inner.storage.update_task_status(
                            &task_ref,
                            TaskStatus::Queued,
                            StatusUpdate::none(),
                        )
                    })
                    .await?;
                    let mut row = task.clone();
                    row.status = TaskStatus::Queued;
                    Self::enqueue_task(inner, &row).await?;
                }

                TaskStatus::Pending => {}
            }
        }

        Self::release_ready(inner, &workflow).await?;
        Self::check_workflow(inner, workflow_id).await?;
        debug!("recovered workflow {}", workflow_id);
        Ok(())
    }
}

/// Retries transient storage faults before giving up.
async fn with_storage_retry<T, F, Fut>(op: &str, mut call: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut delay = Duration::from_millis(50);
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.kind() == ErrorKind::Transport && attempt < 2 => {
                warn!("storage {} failed transiently, retrying: {}", op, err);
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gleitzeit_storage::MemoryStorage;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.workers, 4);
        assert!(config.visibility_margin > Duration::ZERO);
        assert!(config.queue.max_depth > 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let engine = ExecutionEngine::new(EngineConfig::default(), Arc::new(MemoryStorage::new()));
        engine.start().await.unwrap();
        engine.start().await.unwrap();
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_not_found() {
        let engine = ExecutionEngine::new(EngineConfig::default(), Arc::new(MemoryStorage::new()));
        engine.start().await.unwrap();

        let err = engine.get_workflow_status("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = engine.cancel_workflow("missing", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        engine.stop().await;
    }
}
