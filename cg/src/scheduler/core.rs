//! Scheduler implementation

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{ConfigError, SchedulerConfig, SchedulerConfigUpdate};
use super::handle::{Call, CallHandle};
use super::queue::{
    AbortReason, Attempt, BackoffTask, Job, QueueEntry, QueueEntryStatus, QueuedTask, RunningTask, SchedulerCounters,
    SchedulerStats, TaskQueue,
};
use crate::error::{CallError, Throttle};

/// What the processing loop should do next
enum Step {
    /// Slot and window reserved; run this task
    Admit(QueuedTask),
    /// Concurrency limit reached; wait for a slot to free
    AtCapacity,
    /// Window full; wait until the oldest entry expires
    RateLimited { until: Instant },
    /// Nothing queued; the loop exits
    Idle,
}

/// Identity of an attempt, kept while its job is running
struct AttemptMeta {
    id: u64,
    retry_count: u32,
    submitted_at: Instant,
    cancel: CancellationToken,
}

/// How an execution attempt ended
enum Finished {
    Attempt(Attempt),
    Cancelled,
    Panicked,
}

/// Internal state protected by mutex
struct SchedulerInner {
    config: SchedulerConfig,

    /// Tasks waiting for admission
    queue: TaskQueue,

    /// Admitted tasks, keyed by id; its length is the active count
    running: HashMap<u64, RunningTask>,

    /// Throttled tasks waiting out their delay
    backing_off: HashMap<u64, BackoffTask>,

    /// Admission timestamps for rate limiting (sliding window)
    request_times: VecDeque<Instant>,

    /// Set while a processing loop owns admission
    processing: bool,

    /// Wakes the current processing loop; replaced on reset to retire the old loop
    wake: Arc<Notify>,

    next_id: u64,

    counters: SchedulerCounters,
}

impl SchedulerInner {
    fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            queue: TaskQueue::default(),
            running: HashMap::new(),
            backing_off: HashMap::new(),
            request_times: VecDeque::new(),
            processing: false,
            wake: Arc::new(Notify::new()),
            next_id: 1,
            counters: SchedulerCounters::default(),
        }
    }

    /// Drop ledger entries that have aged out of the window
    fn prune(&mut self, now: Instant) {
        let window = self.config.rate_window();
        while self
            .request_times
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            self.request_times.pop_front();
        }
    }

    /// Admission check; reserves the slot and window entry in the same critical section
    ///
    /// Waiting tasks whose token was cancelled are moved into `cancelled`
    /// instead of being admitted.
    fn next_step(&mut self, now: Instant, cancelled: &mut Vec<QueuedTask>) -> Step {
        self.prune(now);

        if self.queue.is_empty() {
            self.processing = false;
            return Step::Idle;
        }

        let max_requests = self.config.max_requests_per_minute.max(1) as usize;
        if self.request_times.len() >= max_requests {
            let until = match self.request_times.front() {
                Some(oldest) => *oldest + self.config.rate_window(),
                None => now,
            };
            return Step::RateLimited { until };
        }

        if self.running.len() >= self.config.max_concurrent_requests.max(1) {
            return Step::AtCapacity;
        }

        let task = loop {
            match self.queue.pop() {
                Some(task) if task.cancel.is_cancelled() => {
                    self.counters.total_cancelled += 1;
                    cancelled.push(task);
                }
                Some(task) => break task,
                None => {
                    self.processing = false;
                    return Step::Idle;
                }
            }
        };

        self.request_times.push_back(now);
        self.running.insert(
            task.id,
            RunningTask {
                retry_count: task.retry_count,
                started_at: now,
            },
        );
        self.counters.total_admitted += 1;
        self.counters.peak_concurrent = self.counters.peak_concurrent.max(self.running.len());

        Step::Admit(task)
    }

    fn note_queue_depth(&mut self) {
        self.counters.peak_queue_depth = self.counters.peak_queue_depth.max(self.queue.len());
    }

    /// Take every waiting task (queued or backing off)
    fn take_waiting(&mut self) -> Vec<QueuedTask> {
        let mut waiting = self.queue.drain();
        waiting.extend(self.backing_off.drain().map(|(_, entry)| entry.task));
        self.counters.total_cleared += waiting.len() as u64;
        waiting
    }
}

struct Shared {
    inner: Mutex<SchedulerInner>,
}

impl Shared {
    /// Make sure a processing loop will look at the queue
    fn kick(self: &Arc<Self>, inner: &mut SchedulerInner) {
        if inner.processing {
            inner.wake.notify_one();
            return;
        }
        debug!("Scheduler::kick: starting processing loop");
        tokio::spawn(Arc::clone(self).process(Arc::clone(&inner.wake)));
        inner.processing = true;
    }

    /// The single dequeue-admit-execute loop
    async fn process(self: Arc<Self>, wake: Arc<Notify>) {
        debug!("Scheduler::process: called");
        let mut cancelled = Vec::new();
        loop {
            let step = {
                let mut inner = self.inner.lock();
                if !Arc::ptr_eq(&inner.wake, &wake) {
                    debug!("Scheduler::process: retired by reset");
                    return;
                }
                inner.next_step(Instant::now(), &mut cancelled)
            };

            for task in cancelled.drain(..) {
                debug!(id = task.id, "Scheduler::process: dropping cancelled task");
                task.job.abort(AbortReason::Cancelled);
            }

            match step {
                Step::Admit(task) => {
                    debug!(id = task.id, attempt = task.retry_count + 1, "Scheduler::process: admitted");
                    self.spawn_attempt(task);
                }
                Step::AtCapacity => {
                    debug!("Scheduler::process: at concurrency limit, waiting for a slot");
                    wake.notified().await;
                }
                Step::RateLimited { until } => {
                    debug!(wait = ?until.saturating_duration_since(Instant::now()), "Scheduler::process: rate window full");
                    tokio::select! {
                        _ = tokio::time::sleep_until(until) => {}
                        _ = wake.notified() => {}
                    }
                }
                Step::Idle => {
                    debug!("Scheduler::process: queue empty, stopping");
                    return;
                }
            }
        }
    }

    fn spawn_attempt(self: &Arc<Self>, task: QueuedTask) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let QueuedTask {
                id,
                retry_count,
                submitted_at,
                cancel,
                job,
            } = task;

            // Outlives `finish`, so a cancelled caller sees its result only after the slot is released
            let mut run = pin!(AssertUnwindSafe(job.run()).catch_unwind());
            let finished = tokio::select! {
                biased;
                _ = cancel.cancelled() => Finished::Cancelled,
                result = &mut run => match result {
                    Ok(attempt) => Finished::Attempt(attempt),
                    Err(_) => Finished::Panicked,
                },
            };

            let meta = AttemptMeta {
                id,
                retry_count,
                submitted_at,
                cancel,
            };
            shared.finish(meta, finished);
        });
    }

    /// Release the slot held by an attempt and route its outcome
    fn finish(self: &Arc<Self>, meta: AttemptMeta, finished: Finished) {
        let id = meta.id;
        let attempt = meta.retry_count + 1;
        let mut exhausted = None;
        let mut settle = None;

        let mut inner = self.inner.lock();
        inner.running.remove(&id);

        match finished {
            Finished::Attempt(Attempt::Succeeded(deliver)) => {
                debug!(id, attempt, "Scheduler::finish: succeeded");
                inner.counters.total_succeeded += 1;
                settle = Some(deliver);
            }
            Finished::Attempt(Attempt::Failed(deliver)) => {
                debug!(id, attempt, "Scheduler::finish: terminal failure");
                inner.counters.total_failed += 1;
                settle = Some(deliver);
            }
            Finished::Cancelled => {
                debug!(id, attempt, "Scheduler::finish: cancelled while executing");
                inner.counters.total_cancelled += 1;
            }
            Finished::Panicked => {
                warn!(id, attempt, "Scheduler::finish: work panicked, call abandoned");
                inner.counters.total_failed += 1;
            }
            Finished::Attempt(Attempt::Throttled(job)) if meta.retry_count < inner.config.retry_attempts => {
                let delay = inner.config.backoff_delay(meta.retry_count);
                warn!(id, attempt, ?delay, "Throttled by backend, backing off");
                let now = Instant::now();
                let ready_at = now + delay;
                let task = QueuedTask {
                    id,
                    retry_count: meta.retry_count + 1,
                    submitted_at: meta.submitted_at,
                    cancel: meta.cancel,
                    job,
                };
                inner.backing_off.insert(
                    id,
                    BackoffTask {
                        task,
                        since: now,
                        ready_at,
                    },
                );
                inner.counters.total_retries += 1;

                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep_until(ready_at).await;
                    shared.requeue(id);
                });
            }
            Finished::Attempt(Attempt::Throttled(job)) => {
                warn!(id, attempts = attempt, "Throttled by backend, retries exhausted");
                inner.counters.total_failed += 1;
                exhausted = Some(job);
            }
        }

        inner.wake.notify_one();
        drop(inner);

        if let Some(deliver) = settle {
            deliver();
        }
        if let Some(job) = exhausted {
            job.exhaust(attempt);
        }
    }

    /// Move a task whose backoff expired back into the queue
    fn requeue(self: &Arc<Self>, id: u64) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.backing_off.remove(&id) else {
            debug!(id, "Scheduler::requeue: no longer backing off");
            return;
        };
        if entry.task.cancel.is_cancelled() {
            inner.counters.total_cancelled += 1;
            drop(inner);
            debug!(id, "Scheduler::requeue: cancelled during backoff");
            entry.task.job.abort(AbortReason::Cancelled);
            return;
        }
        let placement = inner.config.retry_placement;
        debug!(id, %placement, "Scheduler::requeue: reinserting");
        inner.queue.push_retry(entry.task, placement);
        inner.note_queue_depth();
        self.kick(&mut inner);
    }
}

fn throttled<E: Throttle>(error: &E) -> bool {
    error.is_throttled()
}

/// Admission, rate-limit and retry scheduler for calls to one backend
///
/// Cloning is cheap and every clone drives the same queue, ledger and
/// concurrency slots. Submitting work requires a Tokio runtime.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("stats", &self.stats()).finish()
    }
}

impl Scheduler {
    /// Create a new scheduler with the given configuration
    pub fn new(config: SchedulerConfig) -> Self {
        debug!(?config, "Scheduler::new: called");
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(SchedulerInner::new(config)),
            }),
        }
    }

    /// Run `work` under the scheduler, retrying while it reports throttling
    pub async fn execute<T, E, F, Fut>(&self, work: F) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Throttle + Send + 'static,
    {
        self.submit(work).await
    }

    /// Like [`Scheduler::execute`] with a caller-supplied retry classifier
    pub async fn execute_with<T, E, F, Fut, C>(&self, work: F, classify: C) -> Result<T, CallError<E>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        C: Fn(&E) -> bool + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.submit_with(work, classify).await
    }

    /// Enqueue `work` and return a handle to its eventual result
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn submit<T, E, F, Fut>(&self, work: F) -> CallHandle<T, E>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Throttle + Send + 'static,
    {
        self.submit_with(work, throttled::<E>)
    }

    /// Enqueue `work` with a caller-supplied retry classifier
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime. Nothing is enqueued in that
    /// case, so the scheduler stays usable.
    pub fn submit_with<T, E, F, Fut, C>(&self, work: F, classify: C) -> CallHandle<T, E>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        C: Fn(&E) -> bool + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        // Fail before touching state so a caught panic leaves the scheduler usable
        if let Err(e) = tokio::runtime::Handle::try_current() {
            panic!("Scheduler::submit_with: no Tokio runtime: {}", e);
        }

        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let mut inner = self.shared.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        debug!(id, queued = inner.queue.len(), "Scheduler::submit_with: called");

        inner.queue.push(QueuedTask {
            id,
            retry_count: 0,
            submitted_at: Instant::now(),
            cancel: cancel.clone(),
            job: Box::new(Call::new(work, classify, tx)),
        });
        inner.counters.total_submitted += 1;
        inner.note_queue_depth();
        self.shared.kick(&mut inner);
        drop(inner);

        CallHandle::new(id, rx, cancel, self.clone())
    }

    /// Cancel one task; see [`CallHandle::cancel`]
    pub(crate) fn cancel_task(&self, id: u64, cancel: &CancellationToken) {
        cancel.cancel();

        let mut inner = self.shared.inner.lock();
        let waiting = match inner.queue.remove(id) {
            Some(task) => Some(task),
            None => inner.backing_off.remove(&id).map(|entry| entry.task),
        };
        if waiting.is_some() {
            inner.counters.total_cancelled += 1;
        }
        drop(inner);

        if let Some(task) = waiting {
            debug!(id, "Scheduler::cancel_task: removed waiting task");
            task.job.abort(AbortReason::Cancelled);
        }
    }

    /// Fail every waiting task with `QueueCleared`; executions are untouched
    ///
    /// Returns the number of tasks failed. Tasks waiting out a retry delay
    /// count as waiting.
    pub fn clear_queue(&self) -> usize {
        debug!("Scheduler::clear_queue: called");
        let waiting = self.shared.inner.lock().take_waiting();
        let count = waiting.len();
        for task in waiting {
            task.job.abort(AbortReason::QueueCleared);
        }
        info!(count, "Cleared scheduler queue");
        count
    }

    /// Clear the queue, the rate window and the active count, and stop the loop
    ///
    /// Executions already running keep going and still settle their callers,
    /// but no longer count against the concurrency limit.
    pub fn reset(&self) {
        debug!("Scheduler::reset: called");
        let mut inner = self.shared.inner.lock();
        let waiting = inner.take_waiting();
        inner.running.clear();
        inner.request_times.clear();
        inner.processing = false;
        let retired = std::mem::replace(&mut inner.wake, Arc::new(Notify::new()));
        retired.notify_one();
        drop(inner);

        let count = waiting.len();
        for task in waiting {
            task.job.abort(AbortReason::QueueCleared);
        }
        info!(cleared = count, "Scheduler reset");
    }

    /// Replace configuration fields; applies from the next admission check
    pub fn update_options(&self, update: SchedulerConfigUpdate) -> Result<(), ConfigError> {
        debug!(?update, "Scheduler::update_options: called");
        let mut inner = self.shared.inner.lock();
        let config = update.apply_to(&inner.config);
        config.validate()?;
        inner.config = config;
        inner.wake.notify_one();
        Ok(())
    }

    /// Current configuration
    pub fn config(&self) -> SchedulerConfig {
        self.shared.inner.lock().config.clone()
    }

    /// Point-in-time statistics; does not modify the ledger
    pub fn stats(&self) -> SchedulerStats {
        let inner = self.shared.inner.lock();
        let now = Instant::now();
        let window = inner.config.rate_window();

        let requests_last_minute = inner
            .request_times
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < window)
            .count();
        let max_requests = inner.config.max_requests_per_minute.max(1) as f64;

        SchedulerStats {
            active_requests: inner.running.len(),
            queued_requests: inner.queue.len(),
            backing_off_requests: inner.backing_off.len(),
            requests_last_minute,
            utilization_percentage: requests_last_minute as f64 / max_requests * 100.0,
            counters: inner.counters.clone(),
        }
    }

    /// Every task the scheduler holds: running, then queued in admission order, then backing off
    pub fn queue_details(&self) -> Vec<QueueEntry> {
        let inner = self.shared.inner.lock();
        let now = Instant::now();

        let mut running: Vec<_> = inner
            .running
            .iter()
            .map(|(id, r)| QueueEntry {
                id: *id,
                status: QueueEntryStatus::Running,
                attempt: r.retry_count + 1,
                wait_time: now.saturating_duration_since(r.started_at),
            })
            .collect();
        running.sort_by_key(|e| e.id);

        let queued = inner.queue.iter().map(|t| QueueEntry {
            id: t.id,
            status: QueueEntryStatus::Queued,
            attempt: t.retry_count + 1,
            wait_time: now.saturating_duration_since(t.submitted_at),
        });

        let mut backing_off: Vec<_> = inner.backing_off.values().collect();
        backing_off.sort_by_key(|b| b.ready_at);
        let backing_off = backing_off.into_iter().map(|b| QueueEntry {
            id: b.task.id,
            status: QueueEntryStatus::BackingOff,
            attempt: b.task.retry_count + 1,
            wait_time: now.saturating_duration_since(b.since),
        });

        running.into_iter().chain(queued).chain(backing_off).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::BoxFuture;

    use crate::error::BackendError;
    use crate::scheduler::RetryPlacement;

    fn config(max_concurrent: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_requests: max_concurrent,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            ..Default::default()
        }
    }

    /// Work that is throttled for the first `throttled` calls, then returns the call number
    fn flaky(
        calls: Arc<AtomicU32>,
        throttled: u32,
    ) -> impl FnMut() -> BoxFuture<'static, Result<u32, BackendError>> + Send + 'static {
        move || -> BoxFuture<'static, Result<u32, BackendError>> {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= throttled {
                    Err(BackendError::throttled("slow down"))
                } else {
                    Ok(n)
                }
            })
        }
    }

    fn record(log: &Arc<Mutex<Vec<String>>>, entry: impl Into<String>) {
        log.lock().push(entry.into());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_returns_value() {
        let scheduler = Scheduler::new(config(2));
        let result = scheduler.execute(|| async { Ok::<_, BackendError>(42) }).await;
        assert_eq!(result.unwrap(), 42);

        let stats = scheduler.stats();
        assert_eq!(stats.active_requests, 0);
        assert_eq!(stats.queued_requests, 0);
        assert_eq!(stats.requests_last_minute, 1);
        assert_eq!(stats.counters.total_succeeded, 1);
    }

    #[tokio::test]
    async fn test_submit_outside_runtime_leaves_scheduler_usable() {
        let scheduler = Scheduler::new(config(1));

        let outside = scheduler.clone();
        let panicked = std::thread::spawn(move || {
            std::panic::catch_unwind(AssertUnwindSafe(|| {
                outside.submit(|| async { Ok::<_, BackendError>(1) });
            }))
            .is_err()
        })
        .join()
        .unwrap();
        assert!(panicked);

        let stats = scheduler.stats();
        assert_eq!(stats.queued_requests, 0);
        assert_eq!(stats.counters.total_submitted, 0);

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            scheduler.execute(|| async { Ok::<_, BackendError>(2) }),
        )
        .await;
        assert_eq!(result.unwrap().unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slot_released_before_caller_resumes() {
        let scheduler = Scheduler::new(SchedulerConfig {
            max_requests_per_minute: 10_000,
            ..config(4)
        });

        for i in 0..200u32 {
            let result = scheduler.execute(move || async move { Ok::<_, BackendError>(i) }).await;
            assert_eq!(result.unwrap(), i);
            assert_eq!(scheduler.stats().active_requests, 0);

            let err = scheduler
                .execute(|| async { Err::<u32, _>(BackendError::from_status(500, "boom")) })
                .await
                .unwrap_err();
            assert!(matches!(err, CallError::Terminal(_)));
            assert_eq!(scheduler.stats().active_requests, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_not_retried() {
        let scheduler = Scheduler::new(config(2));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = scheduler
            .execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<u32, _>(BackendError::from_status(500, "boom")) }
            })
            .await;

        match result {
            Err(CallError::Terminal(e)) => assert_eq!(e.status, 500),
            other => panic!("expected terminal error, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_law() {
        let scheduler = Scheduler::new(SchedulerConfig {
            initial_backoff_ms: 100,
            backoff_multiplier: 2.0,
            ..Default::default()
        });
        let calls = Arc::new(AtomicU32::new(0));

        let start = Instant::now();
        let result = scheduler.execute(flaky(Arc::clone(&calls), 2)).await;

        assert_eq!(result.unwrap(), 3);
        assert!(start.elapsed() >= Duration::from_millis(300), "elapsed {:?}", start.elapsed());
        assert_eq!(scheduler.stats().counters.total_retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_carries_last_error() {
        let scheduler = Scheduler::new(SchedulerConfig {
            retry_attempts: 2,
            ..config(1)
        });
        let calls = Arc::new(AtomicU32::new(0));

        let result = scheduler.execute(flaky(Arc::clone(&calls), u32::MAX)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(CallError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, BackendError::throttled("slow down"));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retry_budget_fails_on_first_throttle() {
        let scheduler = Scheduler::new(SchedulerConfig {
            retry_attempts: 0,
            ..config(1)
        });
        let calls = Arc::new(AtomicU32::new(0));

        let result = scheduler.execute(flaky(Arc::clone(&calls), 1)).await;

        assert!(result.unwrap_err().is_retries_exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_serializes_work() {
        let scheduler = Scheduler::new(config(1));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                scheduler.submit(move || {
                    let in_flight = Arc::clone(&in_flight);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, BackendError>(i)
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = scheduler.stats();
        assert_eq!(stats.active_requests, 1);
        assert_eq!(stats.queued_requests, 2);

        let results: Vec<_> = futures::future::join_all(handles).await;
        let values: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.stats().counters.peak_concurrent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_delays_admission() {
        let scheduler = Scheduler::new(SchedulerConfig {
            max_requests_per_minute: 2,
            ..config(10)
        });
        let start = Instant::now();

        let handles: Vec<_> = (0..3)
            .map(|i| scheduler.submit(move || async move { Ok::<_, BackendError>((i, Instant::now())) }))
            .collect();

        let results: Vec<_> = futures::future::join_all(handles).await;
        let times: Vec<_> = results.into_iter().map(|r| r.unwrap().1).collect();

        assert!(times[0].duration_since(start) < Duration::from_secs(1));
        assert!(times[1].duration_since(start) < Duration::from_secs(1));
        assert!(times[2].duration_since(start) >= Duration::from_secs(60));
    }

    /// T1 holds the only slot, T2 is throttled once, T3 waits behind the full window
    async fn retry_order(placement: RetryPlacement) -> Vec<String> {
        let scheduler = Scheduler::new(SchedulerConfig {
            max_requests_per_minute: 2,
            retry_placement: placement,
            ..config(1)
        });
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&log);
        let h1 = scheduler.submit(move || {
            let log = Arc::clone(&first);
            async move {
                record(&log, "t1");
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, BackendError>(())
            }
        });

        let second = Arc::clone(&log);
        let attempts = Arc::new(AtomicU32::new(0));
        let h2 = scheduler.submit(move || {
            let log = Arc::clone(&second);
            let attempts = Arc::clone(&attempts);
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                record(&log, format!("t2-{}", n));
                if n == 1 {
                    Err(BackendError::throttled("slow down"))
                } else {
                    Ok(())
                }
            }
        });

        let third = Arc::clone(&log);
        let h3 = scheduler.submit(move || {
            let log = Arc::clone(&third);
            async move {
                record(&log, "t3");
                Ok::<_, BackendError>(())
            }
        });

        let (r1, r2, r3) = tokio::join!(h1, h2, h3);
        assert!(r1.is_ok() && r2.is_ok() && r3.is_ok());

        let order = log.lock().clone();
        order
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reinserted_at_head() {
        assert_eq!(retry_order(RetryPlacement::Front).await, vec!["t1", "t2-1", "t2-2", "t3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_reinserted_at_tail() {
        assert_eq!(retry_order(RetryPlacement::Back).await, vec!["t1", "t2-1", "t3", "t2-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_queue_spares_executing_task() {
        let scheduler = Scheduler::new(config(1));

        let h1 = scheduler.submit(|| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, BackendError>("done")
        });
        let h2 = scheduler.submit(|| async { Ok::<_, BackendError>("never") });
        let h3 = scheduler.submit(|| async { Ok::<_, BackendError>("never") });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.clear_queue(), 2);

        assert!(h2.await.unwrap_err().is_queue_cleared());
        assert!(h3.await.unwrap_err().is_queue_cleared());
        assert_eq!(h1.await.unwrap(), "done");

        let stats = scheduler.stats();
        assert_eq!(stats.queued_requests, 0);
        assert_eq!(stats.counters.total_cleared, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_queued_task() {
        let scheduler = Scheduler::new(config(1));
        let calls = Arc::new(AtomicU32::new(0));

        let h1 = scheduler.submit(|| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, BackendError>(0)
        });
        let h2 = scheduler.submit(flaky(Arc::clone(&calls), 0));

        tokio::time::sleep(Duration::from_millis(10)).await;
        h2.cancel();
        assert!(h2.is_cancelled());
        assert_eq!(scheduler.stats().queued_requests, 0);
        assert!(h2.await.unwrap_err().is_cancelled());

        assert_eq!(h1.await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_token_skips_admission() {
        let scheduler = Scheduler::new(config(1));
        let calls = Arc::new(AtomicU32::new(0));

        let h1 = scheduler.submit(|| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, BackendError>(0)
        });
        let h2 = scheduler.submit(flaky(Arc::clone(&calls), 0));
        h2.cancel_token().cancel();

        assert_eq!(h1.await.unwrap(), 0);
        assert!(h2.await.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let stats = scheduler.stats();
        assert_eq!(stats.requests_last_minute, 1);
        assert_eq!(stats.counters.total_cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_executing_task_releases_slot() {
        let scheduler = Scheduler::new(config(1));

        let slow = scheduler.submit(|| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, BackendError>("slow")
        });
        let fast = scheduler.submit(|| async { Ok::<_, BackendError>("fast") });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.stats().active_requests, 1);

        let start = Instant::now();
        slow.cancel();
        assert!(slow.await.unwrap_err().is_cancelled());
        assert_eq!(fast.await.unwrap(), "fast");
        assert!(start.elapsed() < Duration::from_secs(1));

        let stats = scheduler.stats();
        assert_eq!(stats.active_requests, 0);
        assert_eq!(stats.requests_last_minute, 2);
        assert_eq!(stats.counters.total_cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let scheduler = Scheduler::new(SchedulerConfig {
            initial_backoff_ms: 5_000,
            ..config(1)
        });
        let calls = Arc::new(AtomicU32::new(0));

        let handle = scheduler.submit(flaky(Arc::clone(&calls), 1));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let details = scheduler.queue_details();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].status, QueueEntryStatus::BackingOff);
        assert_eq!(details[0].attempt, 2);

        let start = Instant::now();
        handle.cancel();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(scheduler.queue_details().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_state_and_accepts_new_work() {
        let scheduler = Scheduler::new(SchedulerConfig {
            max_requests_per_minute: 1,
            ..config(1)
        });

        let first = scheduler.submit(|| async { Ok::<_, BackendError>(1) });
        let blocked = scheduler.submit(|| async { Ok::<_, BackendError>(2) });

        assert_eq!(first.await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = scheduler.stats();
        assert_eq!(stats.requests_last_minute, 1);
        assert_eq!(stats.queued_requests, 1);

        scheduler.reset();
        assert!(blocked.await.unwrap_err().is_queue_cleared());

        let stats = scheduler.stats();
        assert_eq!(stats.requests_last_minute, 0);
        assert_eq!(stats.active_requests, 0);
        assert_eq!(stats.queued_requests, 0);

        let start = Instant::now();
        let after = scheduler.execute(|| async { Ok::<_, BackendError>(3) }).await;
        assert_eq!(after.unwrap(), 3);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_options_takes_effect_at_next_admission() {
        let scheduler = Scheduler::new(config(1));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                scheduler.submit(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, BackendError>(())
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.stats().active_requests, 1);

        scheduler
            .update_options(SchedulerConfigUpdate {
                max_concurrent_requests: Some(3),
                ..Default::default()
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.stats().active_requests, 3);
        assert_eq!(scheduler.config().max_concurrent_requests, 3);

        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_update_options_rejects_invalid_config() {
        let scheduler = Scheduler::new(config(2));
        let err = scheduler
            .update_options(SchedulerConfigUpdate {
                max_requests_per_minute: Some(0),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, ConfigError::Zero("max-requests-per-minute"));
        assert_eq!(scheduler.config().max_requests_per_minute, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_work_is_abandoned() {
        let scheduler = Scheduler::new(config(1));

        let result = scheduler
            .execute(|| async {
                if true {
                    panic!("transport bug");
                }
                Ok::<u32, BackendError>(0)
            })
            .await;
        assert!(matches!(result, Err(CallError::Abandoned)));

        let after = scheduler.execute(|| async { Ok::<_, BackendError>(7) }).await;
        assert_eq!(after.unwrap(), 7);
        assert_eq!(scheduler.stats().active_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_custom_classifier() {
        let scheduler = Scheduler::new(config(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = scheduler
            .execute_with(
                move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n == 1 {
                            Err("HTTP 429: too many requests".to_string())
                        } else {
                            Ok(n)
                        }
                    }
                },
                |e: &String| e.contains("429"),
            )
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_utilization_and_window_expiry() {
        let scheduler = Scheduler::new(SchedulerConfig {
            max_requests_per_minute: 4,
            ..config(2)
        });

        for _ in 0..2 {
            scheduler.execute(|| async { Ok::<_, BackendError>(()) }).await.unwrap();
        }

        let stats = scheduler.stats();
        assert_eq!(stats.requests_last_minute, 2);
        assert_eq!(stats.utilization_percentage, 50.0);
        assert_eq!(scheduler.stats(), stats);

        tokio::time::sleep(Duration::from_secs(61)).await;
        let stats = scheduler.stats();
        assert_eq!(stats.requests_last_minute, 0);
        assert_eq!(stats.utilization_percentage, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_details_order() {
        let scheduler = Scheduler::new(config(1));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                scheduler.submit(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, BackendError>(())
                })
            })
            .collect();
        let ids: Vec<_> = handles.iter().map(|h| h.id()).collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let details = scheduler.queue_details();
        let seen: Vec<_> = details.iter().map(|e| (e.id, e.status)).collect();
        assert_eq!(
            seen,
            vec![
                (ids[0], QueueEntryStatus::Running),
                (ids[1], QueueEntryStatus::Queued),
                (ids[2], QueueEntryStatus::Queued),
            ]
        );

        futures::future::join_all(handles).await;
        assert!(scheduler.queue_details().is_empty());
    }
}
