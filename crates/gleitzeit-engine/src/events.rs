//! Engine lifecycle events for optional subscribers.

use gleitzeit_core::{TaskRef, WorkflowId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Lifecycle events surfaced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A workflow was accepted and persisted.
    WorkflowSubmitted { workflow_id: WorkflowId },
    /// A workflow's first tasks were released.
    WorkflowStarted { workflow_id: WorkflowId },
    /// Every task completed.
    WorkflowCompleted { workflow_id: WorkflowId },
    /// The workflow failed under its error strategy.
    WorkflowFailed { workflow_id: WorkflowId },
    /// The workflow was cancelled.
    WorkflowCancelled { workflow_id: WorkflowId },

    /// A task entered the queue.
    TaskQueued { task: TaskRef },
    /// A worker started executing a task.
    TaskStarted { task: TaskRef, attempt: u32 },
    /// A task completed.
    TaskCompleted { task: TaskRef, attempt: u32 },
    /// A task failed terminally.
    TaskFailed {
        task: TaskRef,
        attempt: u32,
        error: String,
    },
    /// A task failed retryably and is waiting for its delayed re-enqueue.
    TaskRetrying {
        task: TaskRef,
        attempt: u32,
        delay_ms: u64,
    },
    /// A task was cancelled.
    TaskCancelled { task: TaskRef },
}

/// Subscription handle; receives every event published after creation.
pub struct Subscription {
    id: Uuid,
    receiver: mpsc::UnboundedReceiver<EngineEvent>,
    bus: EventBus,
}

impl Subscription {
    /// Receives the next event.
    pub async fn next(&mut self) -> Option<EngineEvent> {
        self.receiver.recv().await
    }

    /// Receives an event without blocking.
    pub fn try_next(&mut self) -> Option<EngineEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.senders.write().remove(&self.id);
    }
}

/// Fan-out event bus for engine lifecycle events.
#[derive(Clone, Default)]
pub struct EventBus {
    senders: Arc<RwLock<HashMap<Uuid, mpsc::UnboundedSender<EngineEvent>>>>,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.write().insert(id, tx);
        Subscription {
            id,
            receiver: rx,
            bus: self.clone(),
        }
    }

    /// Publishes an event to every live subscriber.
    pub fn publish(&self, event: EngineEvent) {
        let mut dead = Vec::new();
        {
            let senders = self.senders.read();
            for (id, sender) in senders.iter() {
                if sender.send(event.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }
        if !dead.is_empty() {
            let mut senders = self.senders.write();
            for id in dead {
                senders.remove(&id);
            }
        }
    }

    /// Current number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.senders.read().len()
    }
}
