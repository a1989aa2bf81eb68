//! Queue types for the scheduler

use std::collections::VecDeque;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::config::RetryPlacement;

/// Delivers a finished attempt's result to its caller
pub(crate) type Settle = Box<dyn FnOnce() + Send>;

/// Result of one execution attempt
///
/// Final outcomes carry their settlement so the scheduler can release the
/// slot before the caller observes the result.
pub(crate) enum Attempt {
    /// Work produced a value
    Succeeded(Settle),
    /// Work failed terminally
    Failed(Settle),
    /// Work was throttled; ownership returns to the scheduler for a retry
    Throttled(Box<dyn Job>),
}

/// Synthetic failures the scheduler delivers on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AbortReason {
    QueueCleared,
    Cancelled,
}

/// Type-erased unit of work bundled with its settlement channel
///
/// Every settling method consumes the job, so a settled task cannot be
/// queued or run again.
pub(crate) trait Job: Send + 'static {
    /// Run the work once
    fn run(self: Box<Self>) -> BoxFuture<'static, Attempt>;

    /// Settle with `RetriesExhausted`, carrying the last throttling error
    fn exhaust(self: Box<Self>, attempts: u32);

    /// Settle with a synthetic failure
    fn abort(self: Box<Self>, reason: AbortReason);
}

/// A task waiting for admission
pub(crate) struct QueuedTask {
    pub id: u64,
    pub retry_count: u32,
    pub submitted_at: Instant,
    pub cancel: CancellationToken,
    pub job: Box<dyn Job>,
}

/// A task sitting out its retry delay
pub(crate) struct BackoffTask {
    pub task: QueuedTask,
    pub since: Instant,
    pub ready_at: Instant,
}

/// Bookkeeping for an admitted task
pub(crate) struct RunningTask {
    pub retry_count: u32,
    pub started_at: Instant,
}

/// Waiting tasks: first attempts FIFO, plus a lane for retries under `Fair`
#[derive(Default)]
pub(crate) struct TaskQueue {
    main: VecDeque<QueuedTask>,
    retries: VecDeque<QueuedTask>,
    prefer_retry: bool,
}

impl TaskQueue {
    /// Enqueue a first attempt
    pub fn push(&mut self, task: QueuedTask) {
        self.main.push_back(task);
    }

    /// Reinsert a task whose backoff has expired
    pub fn push_retry(&mut self, task: QueuedTask, placement: RetryPlacement) {
        match placement {
            RetryPlacement::Front => self.main.push_front(task),
            RetryPlacement::Back => self.main.push_back(task),
            RetryPlacement::Fair => self.retries.push_back(task),
        }
    }

    /// Next task to admit
    pub fn pop(&mut self) -> Option<QueuedTask> {
        let take_retry = match (self.retries.is_empty(), self.main.is_empty()) {
            (true, _) => false,
            (false, true) => true,
            (false, false) => self.prefer_retry,
        };
        let task = if take_retry {
            self.retries.pop_front()
        } else {
            self.main.pop_front()
        };
        if task.is_some() {
            self.prefer_retry = !take_retry;
        }
        task
    }

    /// Remove a specific task, wherever it waits
    pub fn remove(&mut self, id: u64) -> Option<QueuedTask> {
        if let Some(pos) = self.main.iter().position(|t| t.id == id) {
            return self.main.remove(pos);
        }
        let pos = self.retries.iter().position(|t| t.id == id)?;
        self.retries.remove(pos)
    }

    /// Take every waiting task, leaving the queue empty
    pub fn drain(&mut self) -> Vec<QueuedTask> {
        self.prefer_retry = false;
        self.main.drain(..).chain(self.retries.drain(..)).collect()
    }

    pub fn len(&self) -> usize {
        self.main.len() + self.retries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_empty() && self.retries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedTask> {
        self.main.iter().chain(self.retries.iter())
    }
}

/// Lifetime counters for the scheduler
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerCounters {
    pub total_submitted: u64,
    pub total_admitted: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub total_retries: u64,
    pub total_cancelled: u64,
    pub total_cleared: u64,
    pub peak_concurrent: usize,
    pub peak_queue_depth: usize,
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    /// Executions currently holding a concurrency slot
    pub active_requests: usize,
    /// Tasks waiting for admission
    pub queued_requests: usize,
    /// Throttled tasks waiting out their retry delay
    pub backing_off_requests: usize,
    /// Admissions still inside the rate window
    pub requests_last_minute: usize,
    /// `requests_last_minute` as a percentage of the window cap
    pub utilization_percentage: f64,
    pub counters: SchedulerCounters,
}

/// Queue entry for display
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: u64,
    pub status: QueueEntryStatus,
    /// 1 for a first attempt, 2 for the first retry, and so on
    pub attempt: u32,
    /// Time spent in the current status
    pub wait_time: Duration,
}

/// Status of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEntryStatus {
    Running,
    Queued,
    BackingOff,
}
