//! The priority queue and its reservation bookkeeping.

use chrono::{DateTime, Utc};
use gleitzeit_core::{Priority, TaskRef};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{QueueError, QueueResult};

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Global depth cap across all buckets (0 = unlimited). Enqueueing at
    /// or above the cap fails with backpressure.
    pub max_depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_depth: 10_000 }
    }
}

/// An entry in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEntry {
    /// The queued task.
    pub task: TaskRef,

    /// Bucket the entry lives in.
    pub priority: Priority,

    /// Timestamp of the original enqueue.
    pub enqueued_at: DateTime<Utc>,

    /// Per-entry visibility override. Must exceed the task's execution
    /// timeout plus a margin so only crashes, not slow tasks, trigger
    /// redelivery.
    pub visibility: Option<Duration>,
}

impl QueuedEntry {
    /// Creates an entry enqueued now.
    pub fn new(task: TaskRef, priority: Priority) -> Self {
        Self {
            task,
            priority,
            enqueued_at: Utc::now(),
            visibility: None,
        }
    }

    /// Sets the per-entry visibility timeout.
    pub fn with_visibility(mut self, visibility: Duration) -> Self {
        self.visibility = Some(visibility);
        self
    }
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Depth of each priority bucket, indexed by `Priority::index()`.
    pub per_priority_depth: [usize; 4],

    /// Number of reserved (in-flight) tasks.
    pub reserved_count: usize,

    /// Total entries accepted since construction.
    pub total_enqueued: u64,

    /// Total entries acknowledged since construction.
    pub total_acked: u64,
}

impl QueueStats {
    /// Total visible depth across all buckets.
    pub fn depth(&self) -> usize {
        self.per_priority_depth.iter().sum()
    }
}

struct Reservation {
    entry: QueuedEntry,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    buckets: [VecDeque<QueuedEntry>; 4],
    queued: HashSet<TaskRef>,
    reserved: HashMap<TaskRef, Reservation>,
    total_enqueued: u64,
    total_acked: u64,
}

impl State {
    fn depth(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }
}

/// Priority task queue with reservation semantics.
///
/// All operations are safe under parallel callers; the bucket state sits
/// behind a single mutex and every public method is a short critical
/// section.
pub struct TaskQueue {
    config: QueueConfig,
    state: Mutex<State>,
    /// Woken on every enqueue so idle consumers can retry a reserve.
    notify: Notify,
}

impl TaskQueue {
    /// Creates a queue with the given configuration.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueues a task at the tail of its priority bucket.
    ///
    /// Idempotent by task reference: a task already queued or reserved is
    /// left untouched and `false` is returned. Fails with backpressure when
    /// the global depth cap is reached.
    pub fn enqueue(&self, entry: QueuedEntry) -> QueueResult<bool> {
        let mut state = self.state.lock();

        if state.queued.contains(&entry.task) || state.reserved.contains_key(&entry.task) {
            debug!("enqueue of {} is a no-op (already queued/reserved)", entry.task);
            return Ok(false);
        }

        let depth = state.depth();
        if self.config.max_depth > 0 && depth >= self.config.max_depth {
            warn!("queue full at depth {}", depth);
            return Err(QueueError::Backpressure {
                depth,
                cap: self.config.max_depth,
            });
        }

        state.queued.insert(entry.task.clone());
        let bucket = entry.priority.index();
        state.buckets[bucket].push_back(entry);
        state.total_enqueued += 1;
        drop(state);

        self.notify.notify_waiters();
        Ok(true)
    }

    /// Re-inserts an entry at the head of its bucket (visibility expiry,
    /// immediate nack). Bypasses the depth cap: the entry was already
    /// accepted once.
    fn requeue_front(state: &mut State, entry: QueuedEntry) {
        if state.queued.contains(&entry.task) {
            return;
        }
        state.queued.insert(entry.task.clone());
        let bucket = entry.priority.index();
        state.buckets[bucket].push_front(entry);
    }

    /// Atomically reserves up to `max_items` tasks from the head of the
    /// highest non-empty bucket. Reserved tasks are invisible to other
    /// consumers until acked, nacked, or past their visibility timeout;
    /// entries with their own visibility override the passed default.
    pub fn reserve(&self, max_items: usize, visibility_timeout: Duration) -> Vec<QueuedEntry> {
        let mut state = self.state.lock();
        let mut reserved = Vec::new();

        for priority in Priority::DESCENDING {
            let bucket = priority.index();
            if state.buckets[bucket].is_empty() {
                continue;
            }

            while reserved.len() < max_items {
                match state.buckets[bucket].pop_front() {
                    Some(entry) => {
                        let visibility = entry.visibility.unwrap_or(visibility_timeout);
                        state.queued.remove(&entry.task);
                        state.reserved.insert(
                            entry.task.clone(),
                            Reservation {
                                entry: entry.clone(),
                                expires_at: Instant::now() + visibility,
                            },
                        );
                        reserved.push(entry);
                    }
                    None => break,
                }
            }
            break;
        }

        reserved
    }

    /// Reserves one task, waiting up to `poll_interval` for an enqueue
    /// when the queue is empty.
    pub async fn reserve_one(
        &self,
        visibility_timeout: Duration,
        poll_interval: Duration,
    ) -> Option<QueuedEntry> {
        if let Some(entry) = self.reserve(1, visibility_timeout).into_iter().next() {
            return Some(entry);
        }

        let notified = self.notify.notified();
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }

        self.reserve(1, visibility_timeout).into_iter().next()
    }

    /// Acknowledges a reserved task: the handoff succeeded and the entry
    /// leaves the queue for good.
    pub fn ack(&self, task: &TaskRef) -> QueueResult<()> {
        let mut state = self.state.lock();
        state
            .reserved
            .remove(task)
            .ok_or_else(|| QueueError::NotReserved(task.to_string()))?;
        state.total_acked += 1;
        Ok(())
    }

    /// Releases a reservation.
    ///
    /// With a zero `requeue_delay` the task reappears at the head of its
    /// bucket and `None` is returned. With a nonzero delay the entry is
    /// handed back to the caller, who schedules the delayed re-enqueue.
    pub fn nack(
        &self,
        task: &TaskRef,
        requeue_delay: Duration,
    ) -> QueueResult<Option<QueuedEntry>> {
        let mut state = self.state.lock();
        let reservation = state
            .reserved
            .remove(task)
            .ok_or_else(|| QueueError::NotReserved(task.to_string()))?;

        if requeue_delay.is_zero() {
            Self::requeue_front(&mut state, reservation.entry);
            drop(state);
            self.notify.notify_waiters();
            Ok(None)
        } else {
            Ok(Some(reservation.entry))
        }
    }

    /// Returns expired reservations to the head of their buckets and
    /// reports which tasks became visible again (at-least-once delivery).
    pub fn expire_reservations(&self, now: Instant) -> Vec<TaskRef> {
        let mut state = self.state.lock();

        let expired: Vec<TaskRef> = state
            .reserved
            .iter()
            .filter(|(_, r)| r.expires_at <= now)
            .map(|(task, _)| task.clone())
            .collect();

        for task in &expired {
            if let Some(reservation) = state.reserved.remove(task) {
                warn!("reservation of {} expired, requeueing", task);
                Self::requeue_front(&mut state, reservation.entry);
            }
        }
        drop(state);

        if !expired.is_empty() {
            self.notify.notify_waiters();
        }
        expired
    }

    /// Earliest reservation expiry, if any task is reserved.
    pub fn next_expiry(&self) -> Option<Instant> {
        let state = self.state.lock();
        state.reserved.values().map(|r| r.expires_at).min()
    }

    /// Removes a task from the queue or the reserved set (workflow
    /// cancellation). Returns whether anything was removed.
    pub fn remove(&self, task: &TaskRef) -> bool {
        let mut state = self.state.lock();

        if state.reserved.remove(task).is_some() {
            return true;
        }
        if state.queued.remove(task) {
            for bucket in state.buckets.iter_mut() {
                if let Some(pos) = bucket.iter().position(|e| &e.task == task) {
                    bucket.remove(pos);
                    return true;
                }
            }
        }
        false
    }

    /// Whether the task is currently queued or reserved.
    pub fn contains(&self, task: &TaskRef) -> bool {
        let state = self.state.lock();
        state.queued.contains(task) || state.reserved.contains_key(task)
    }

    /// Snapshot of queue counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut per_priority_depth = [0usize; 4];
        for (i, bucket) in state.buckets.iter().enumerate() {
            per_priority_depth[i] = bucket.len();
        }
        QueueStats {
            per_priority_depth,
            reserved_count: state.reserved.len(),
            total_enqueued: state.total_enqueued,
            total_acked: state.total_acked,
        }
    }

    /// Visible depth across all buckets.
    pub fn len(&self) -> usize {
        self.state.lock().depth()
    }

    /// Whether no task is visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}
