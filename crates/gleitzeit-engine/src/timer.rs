//! Retry/timeout scheduler: a monotonic min-heap with one tick loop.

use gleitzeit_core::{ProviderId, TaskRef};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Identifier of a scheduled timer entry, used for best-effort
/// cancellation.
pub type TimerEventId = u64;

/// Delayed events the engine consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// A retrying task's backoff delay elapsed; re-enqueue it.
    TaskRetryDue(TaskRef),

    /// A task's execution deadline elapsed. The attempt guard lets the
    /// engine ignore stale firings.
    TaskTimeout {
        /// The task whose deadline elapsed.
        task: TaskRef,
        /// Attempt the deadline was armed for.
        attempt: u32,
    },

    /// A reservation's visibility window elapsed; sweep the queue.
    VisibilityExpired(TaskRef),

    /// Probe a provider's health.
    ProviderHealthProbe(ProviderId),
}

struct Entry {
    due: Instant,
    seq: u64,
    id: TimerEventId,
    event: TimerEvent,
}

// Min-heap ordering: earliest due first, FIFO among equal instants.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Entry>,
    cancelled: HashSet<TimerEventId>,
    next_id: u64,
}

/// Monotonic-time scheduler for delayed engine events.
///
/// `schedule` pushes onto a min-heap; a single tick loop sleeps until the
/// next due instant and emits due events over the engine's channel.
/// Cancellation is best-effort: an entry that already fired is ignored by
/// the handler's attempt guard instead.
#[derive(Clone)]
pub struct TimerService {
    state: Arc<Mutex<TimerState>>,
    notify: Arc<Notify>,
}

impl TimerService {
    /// Creates an idle timer. Call [`Self::run`] from a task to start the
    /// tick loop.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TimerState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Schedules an event `after` from now.
    pub fn schedule(&self, after: Duration, event: TimerEvent) -> TimerEventId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        let seq = id;

        trace!("timer event {} scheduled in {:?}: {:?}", id, after, event);
        state.heap.push(Entry {
            due: Instant::now() + after,
            seq,
            id,
            event,
        });
        drop(state);

        self.notify.notify_waiters();
        id
    }

    /// Cancels a scheduled event. Best-effort: an already-fired event is
    /// unaffected.
    pub fn cancel(&self, id: TimerEventId) {
        self.state.lock().cancelled.insert(id);
    }

    /// Pops every event due at or before now.
    pub fn due_now(&self) -> Vec<TimerEvent> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut due = Vec::new();

        while state
            .heap
            .peek()
            .map(|entry| entry.due <= now)
            .unwrap_or(false)
        {
            let entry = state.heap.pop().unwrap();
            if !state.cancelled.remove(&entry.id) {
                due.push(entry.event);
            }
        }
        due
    }

    /// Next due instant, if any entry is pending.
    fn next_due(&self) -> Option<Instant> {
        self.state.lock().heap.peek().map(|entry| entry.due)
    }

    /// Number of pending entries (including cancelled ones not yet
    /// reaped). Test helper.
    pub fn pending(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Tick loop: wakes at the next due instant and emits events on
    /// `sender` until `shutdown` fires.
    pub async fn run(self, sender: mpsc::UnboundedSender<TimerEvent>, shutdown: CancellationToken) {
        debug!("timer loop started");
        loop {
            for event in self.due_now() {
                if sender.send(event).is_err() {
                    debug!("timer consumer dropped, stopping");
                    return;
                }
            }

            let sleep_until = self
                .next_due()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("timer loop stopped");
                    return;
                }
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(sleep_until)) => {}
            }
        }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_event(id: &str) -> TimerEvent {
        TimerEvent::TaskRetryDue(TaskRef::new("wf", id))
    }

    #[test]
    fn test_due_ordering() {
        // Already-due entries keep schedule order via seq.
        let timer = TimerService::new();
        timer.schedule(Duration::ZERO, task_event("a"));
        timer.schedule(Duration::ZERO, task_event("b"));

        let due = timer.due_now();
        assert_eq!(due, vec![task_event("a"), task_event("b")]);
    }

    #[test]
    fn test_not_due_yet() {
        let timer = TimerService::new();
        timer.schedule(Duration::from_secs(60), task_event("later"));
        assert!(timer.due_now().is_empty());
        assert_eq!(timer.pending(), 1);
    }

    #[test]
    fn test_cancel_is_best_effort() {
        let timer = TimerService::new();
        let keep = timer.schedule(Duration::ZERO, task_event("keep"));
        let drop_id = timer.schedule(Duration::ZERO, task_event("drop"));
        timer.cancel(drop_id);
        let _ = keep;

        let due = timer.due_now();
        assert_eq!(due, vec![task_event("keep")]);
    }

    #[tokio::test]
    async fn test_tick_loop_emits_in_order() {
        let timer = TimerService::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let loop_handle = tokio::spawn(timer.clone().run(tx, shutdown.clone()));

        timer.schedule(Duration::from_millis(40), task_event("b"));
        timer.schedule(Duration::from_millis(10), task_event("a"));

        assert_eq!(rx.recv().await, Some(task_event("a")));
        assert_eq!(rx.recv().await, Some(task_event("b")));

        shutdown.cancel();
        loop_handle.await.unwrap();
    }
}
