//! Worker-driven job queue with retries, per-attempt timeouts and a
//! dead-letter set.
//!
//! A job that fails is retried with exponential backoff until it has used
//! `max_retries` retries, after which it moves to the dead-letter set exactly
//! once. A timed-out attempt runs the job's fallback, if any, and a
//! successful fallback completes the job.

use futures::FutureExt;
use keel_core::{ExponentialBackoff, QueueConfig};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::store::CompletedJobs;
use super::types::{JobError, JobId, JobOperation, JobRecord, JobRequest, JobStatus};
use crate::lifecycle::{Shutdown, ShutdownSignal};

/// Errors returned by [`JobQueue`].
#[derive(Error, Debug, PartialEq)]
pub enum QueueError {
    #[error("Queue is full ({capacity} pending jobs)")]
    QueueFull { capacity: usize },

    #[error("Workers are already running")]
    AlreadyRunning,

    #[error("At least one worker is required")]
    NoWorkers,

    #[error("Job not found: {0}")]
    NotFound(JobId),
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueMetrics {
    pub queued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub timeouts: u64,
    pub fallbacks: u64,
    pub rejected: u64,
    pub pending: usize,
    pub running: usize,
    /// Jobs that failed and await another attempt
    pub retrying: usize,
    /// Succeeded records still retained
    pub completed: u64,
    pub dead_letter: usize,
    pub workers: usize,
}

struct Job {
    record: JobRecord,
    args: Value,
    timeout: Option<Duration>,
    operation: Arc<dyn JobOperation>,
    fallback: Option<Arc<dyn JobOperation>>,
}

/// What a worker needs to run one attempt, cloned out of the lock.
struct Attempt {
    job_id: JobId,
    job_type: String,
    args: Value,
    timeout: Option<Duration>,
    operation: Arc<dyn JobOperation>,
    fallback: Option<Arc<dyn JobOperation>>,
}

#[derive(Default)]
struct QueueState {
    /// Ids ready to run, oldest first
    pending: VecDeque<JobId>,
    /// Every job not yet succeeded or dead-lettered
    active: HashMap<JobId, Job>,
    dead_letter: BTreeMap<JobId, Job>,
}

#[derive(Default)]
struct QueueCounters {
    queued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    timeouts: AtomicU64,
    fallbacks: AtomicU64,
    rejected: AtomicU64,
}

struct Shared {
    config: QueueConfig,
    backoff: ExponentialBackoff,
    state: Mutex<QueueState>,
    completed: CompletedJobs,
    ready: Notify,
    counters: QueueCounters,
}

struct Workers {
    shutdown: Shutdown,
    handles: Vec<JoinHandle<()>>,
}

impl Shared {
    fn claim_next(&self) -> Option<Attempt> {
        let mut state = self.state.lock();
        while let Some(job_id) = state.pending.pop_front() {
            let Some(job) = state.active.get_mut(&job_id) else {
                continue;
            };
            job.record.status = JobStatus::Running;
            job.record.started_at = Some(chrono::Utc::now());
            return Some(Attempt {
                job_id,
                job_type: job.record.job_type.clone(),
                args: job.args.clone(),
                timeout: job.timeout,
                operation: job.operation.clone(),
                fallback: job.fallback.clone(),
            });
        }
        None
    }

    async fn execute(self: &Arc<Self>, worker: usize, attempt: Attempt) {
        tracing::debug!(worker, job_id = %attempt.job_id, job_type = %attempt.job_type, "Running job");

        match run_operation(&attempt.operation, &attempt.args, attempt.timeout).await {
            Ok(value) => self.succeed(attempt.job_id, value, None).await,
            Err(JobError::TimedOut(limit)) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                let Some(fallback) = &attempt.fallback else {
                    self.fail(attempt.job_id, JobError::TimedOut(limit).to_string());
                    return;
                };

                tracing::warn!(
                    job_id = %attempt.job_id,
                    timeout_ms = limit.as_millis() as u64,
                    "Job timed out, running fallback"
                );
                match run_operation(fallback, &attempt.args, None).await {
                    Ok(value) => {
                        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                        let note = format!("timed out after {:?}, fallback executed", limit);
                        self.succeed(attempt.job_id, value, Some(note)).await;
                    }
                    Err(e) => self.fail(
                        attempt.job_id,
                        format!("timed out after {:?}; fallback failed: {}", limit, e),
                    ),
                }
            }
            Err(e) => self.fail(attempt.job_id, e.to_string()),
        }
    }

    async fn succeed(&self, job_id: JobId, value: Value, note: Option<String>) {
        let record = {
            let mut state = self.state.lock();
            let Some(job) = state.active.get_mut(&job_id) else {
                return;
            };
            job.record.status = JobStatus::Succeeded;
            job.record.completed_at = Some(chrono::Utc::now());
            job.record.result = Some(value);
            job.record.used_fallback = note.is_some();
            // Earlier attempts' errors do not outlive success.
            job.record.error = note;
            job.record.clone()
        };

        // Visible in the completed store before it leaves the active map.
        self.completed.insert(record.clone()).await;
        self.state.lock().active.remove(&job_id);
        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            job_id = %job_id,
            job_type = %record.job_type,
            retries = record.retry_count,
            fallback = record.used_fallback,
            "Job succeeded"
        );
    }

    fn fail(self: &Arc<Self>, job_id: JobId, error: String) {
        let mut state = self.state.lock();
        let Some(job) = state.active.get_mut(&job_id) else {
            return;
        };
        job.record.error = Some(error.clone());

        if job.record.retry_count < job.record.max_retries {
            job.record.retry_count += 1;
            job.record.status = JobStatus::Retrying;
            let retry = job.record.retry_count;
            let max_retries = job.record.max_retries;
            drop(state);

            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            let delay = self.backoff.delay(retry);
            tracing::warn!(
                job_id = %job_id,
                retry,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Job failed, scheduling retry"
            );

            let shared = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                shared.requeue(job_id);
            });
            return;
        }

        let Some(mut job) = state.active.remove(&job_id) else {
            return;
        };
        job.record.status = JobStatus::Failed;
        job.record.completed_at = Some(chrono::Utc::now());
        let attempts = job.record.retry_count + 1;
        let job_type = job.record.job_type.clone();

        if let Entry::Vacant(slot) = state.dead_letter.entry(job_id) {
            slot.insert(job);
            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        }
        drop(state);
        self.counters.failed.fetch_add(1, Ordering::Relaxed);

        tracing::error!(
            job_id = %job_id,
            job_type = %job_type,
            attempts,
            error = %error,
            "Job failed permanently, moved to dead letter"
        );
    }

    /// Put a retrying job back at the tail of the pending queue.
    ///
    /// Not subject to `max_queue_size`: the job was admitted once already,
    /// so `pending` may briefly exceed the bound by the number of jobs
    /// waiting out a retry delay.
    fn requeue(&self, job_id: JobId) {
        let mut state = self.state.lock();
        let retrying = state
            .active
            .get(&job_id)
            .is_some_and(|job| job.record.status == JobStatus::Retrying);
        if retrying {
            state.pending.push_back(job_id);
            drop(state);
            self.ready.notify_one();
        }
    }
}

/// Run one attempt, converting timeouts and panics into [`JobError`]s.
async fn run_operation(
    operation: &Arc<dyn JobOperation>,
    args: &Value,
    timeout: Option<Duration>,
) -> Result<Value, JobError> {
    let attempt = AssertUnwindSafe(operation.run(args)).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(JobError::TimedOut(limit)),
        },
        None => attempt.await,
    };
    outcome.unwrap_or_else(|payload| Err(JobError::Panicked(panic_message(payload))))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize, mut signal: ShutdownSignal) {
    tracing::debug!(worker, "Worker started");
    loop {
        if signal.is_triggered() {
            break;
        }

        match shared.claim_next() {
            Some(attempt) => shared.execute(worker, attempt).await,
            None => {
                tokio::select! {
                    _ = signal.triggered() => break,
                    _ = shared.ready.notified() => {}
                    _ = tokio::time::sleep(shared.config.poll_interval) => {}
                }
            }
        }
    }
    tracing::debug!(worker, "Worker stopped");
}

/// Background job queue.
///
/// Jobs may be queued before [`start`](Self::start); they run once workers
/// are up. [`stop`](Self::stop) lets in-flight attempts finish.
pub struct JobQueue {
    shared: Arc<Shared>,
    workers: Mutex<Option<Workers>>,
}

impl JobQueue {
    pub fn new(config: QueueConfig, backoff: ExponentialBackoff) -> Self {
        let completed = CompletedJobs::new(config.max_completed, config.completed_ttl);
        Self {
            shared: Arc::new(Shared {
                config,
                backoff,
                state: Mutex::new(QueueState::default()),
                completed,
                ready: Notify::new(),
                counters: QueueCounters::default(),
            }),
            workers: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    /// Submit a job. Fails with [`QueueError::QueueFull`] once
    /// `max_queue_size` jobs are pending.
    pub fn queue_job(&self, request: JobRequest) -> Result<JobId, QueueError> {
        let config = &self.shared.config;
        let max_retries = request.max_retries.unwrap_or(config.default_max_retries);
        let timeout = request.timeout.or(config.default_timeout);
        let record = JobRecord::new(request.job_type, max_retries, timeout);
        let job_id = record.job_id;

        {
            let mut state = self.shared.state.lock();
            if state.pending.len() >= config.max_queue_size {
                drop(state);
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    job_type = %record.job_type,
                    capacity = config.max_queue_size,
                    "Queue full, rejecting job"
                );
                return Err(QueueError::QueueFull {
                    capacity: config.max_queue_size,
                });
            }

            tracing::debug!(job_id = %job_id, job_type = %record.job_type, "Job queued");
            state.active.insert(
                job_id,
                Job {
                    record,
                    args: request.args,
                    timeout,
                    operation: request.operation,
                    fallback: request.fallback,
                },
            );
            state.pending.push_back(job_id);
        }

        self.shared.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.shared.ready.notify_one();
        Ok(job_id)
    }

    /// Current status of a job, or `None` if unknown (or its succeeded
    /// record has expired).
    pub async fn get_status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.job(job_id).await.map(|record| record.status)
    }

    /// Full record of a job.
    pub async fn job(&self, job_id: &JobId) -> Option<JobRecord> {
        {
            let state = self.shared.state.lock();
            if let Some(job) = state
                .active
                .get(job_id)
                .or_else(|| state.dead_letter.get(job_id))
            {
                return Some(job.record.clone());
            }
        }
        self.shared.completed.get(job_id).await
    }

    /// Records of every dead-lettered job.
    pub fn dead_letter_jobs(&self) -> BTreeMap<JobId, JobRecord> {
        self.shared
            .state
            .lock()
            .dead_letter
            .iter()
            .map(|(id, job)| (*id, job.record.clone()))
            .collect()
    }

    /// Move a dead-lettered job back to the pending queue with a fresh
    /// retry budget.
    pub fn requeue_dead_letter(&self, job_id: &JobId) -> Result<(), QueueError> {
        let capacity = self.shared.config.max_queue_size;
        {
            let mut state = self.shared.state.lock();
            if state.pending.len() >= capacity {
                return Err(QueueError::QueueFull { capacity });
            }
            let mut job = state
                .dead_letter
                .remove(job_id)
                .ok_or(QueueError::NotFound(*job_id))?;

            job.record.status = JobStatus::Pending;
            job.record.retry_count = 0;
            job.record.completed_at = None;
            state.active.insert(*job_id, job);
            state.pending.push_back(*job_id);
        }

        tracing::info!(job_id = %job_id, "Requeued dead-lettered job");
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Launch `worker_count` workers.
    pub fn start(&self, worker_count: usize) -> Result<(), QueueError> {
        if worker_count == 0 {
            return Err(QueueError::NoWorkers);
        }

        let mut workers = self.workers.lock();
        if workers.is_some() {
            return Err(QueueError::AlreadyRunning);
        }

        let shutdown = Shutdown::new();
        let handles = (0..worker_count)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    self.shared.clone(),
                    worker,
                    shutdown.subscribe(),
                ))
            })
            .collect();
        *workers = Some(Workers { shutdown, handles });

        tracing::info!(workers = worker_count, "Job queue started");
        Ok(())
    }

    /// Signal workers to stop and wait for them. Attempts already running
    /// complete first; pending jobs stay queued for a later start.
    pub async fn stop(&self) {
        let workers = self.workers.lock().take();
        let Some(workers) = workers else {
            return;
        };

        workers.shutdown.trigger();
        self.shared.ready.notify_waiters();
        for handle in workers.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::info!("Job queue stopped");
    }

    pub async fn metrics(&self) -> QueueMetrics {
        let (pending, running, retrying, dead_letter) = {
            let state = self.shared.state.lock();
            let count = |status: JobStatus| {
                state
                    .active
                    .values()
                    .filter(|job| job.record.status == status)
                    .count()
            };
            (
                state.pending.len(),
                count(JobStatus::Running),
                count(JobStatus::Retrying),
                state.dead_letter.len(),
            )
        };
        let workers = self
            .workers
            .lock()
            .as_ref()
            .map_or(0, |w| w.handles.len());
        let counters = &self.shared.counters;

        QueueMetrics {
            queued: counters.queued.load(Ordering::Relaxed),
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            fallbacks: counters.fallbacks.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            pending,
            running,
            retrying,
            completed: self.shared.completed.count().await,
            dead_letter,
            workers,
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.get_mut().take() {
            workers.shutdown.trigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::job_fn;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> QueueConfig {
        QueueConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn fast_backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(100)).without_jitter()
    }

    fn queue() -> JobQueue {
        JobQueue::new(fast_config(), fast_backoff())
    }

    /// Operation failing its first `failures` attempts, counting every call.
    fn flaky(failures: u32, attempts: Arc<AtomicU32>) -> Arc<dyn JobOperation> {
        job_fn(move |_| {
            let attempts = attempts.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(JobError::failed(format!("attempt {} failed", n + 1)))
                } else {
                    Ok(json!("done"))
                }
            }
        })
    }

    fn sleeper(duration: Duration) -> Arc<dyn JobOperation> {
        job_fn(move |_| async move {
            tokio::time::sleep(duration).await;
            Ok::<_, JobError>(json!("slow"))
        })
    }

    struct Panicker;

    #[async_trait]
    impl JobOperation for Panicker {
        async fn run(&self, _args: &Value) -> Result<Value, JobError> {
            panic!("kaboom")
        }
    }

    async fn wait_for_terminal(queue: &JobQueue, job_id: &JobId) -> JobRecord {
        for _ in 0..300 {
            if let Some(record) = queue.job(job_id).await {
                if record.status.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never finished", job_id);
    }

    #[tokio::test]
    async fn test_flaky_job_succeeds_after_retries() {
        let queue = queue();
        queue.start(1).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let job_id = queue
            .queue_job(JobRequest::new("flaky", flaky(2, attempts.clone())).max_retries(2))
            .unwrap();
        let record = wait_for_terminal(&queue, &job_id).await;

        assert_eq!(record.status, JobStatus::Succeeded);
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.result, Some(json!("done")));
        assert_eq!(record.error, None);
        assert!(!record.used_fallback);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(queue.dead_letter_jobs().is_empty());

        let metrics = queue.metrics().await;
        assert_eq!(metrics.retried, 2);
        assert_eq!(metrics.succeeded, 1);
        assert_eq!(metrics.completed, 1);
        queue.stop().await;
    }

    type StartLog = Arc<Mutex<Vec<(&'static str, tokio::time::Instant)>>>;

    /// Logs each attempt's start, works for `work`, fails the first `failures` attempts.
    fn logged(name: &'static str, failures: u32, work: Duration, log: StartLog) -> Arc<dyn JobOperation> {
        let attempts = Arc::new(AtomicU32::new(0));
        job_fn(move |_| {
            let attempts = attempts.clone();
            let log = log.clone();
            async move {
                log.lock().push((name, tokio::time::Instant::now()));
                tokio::time::sleep(work).await;
                if attempts.fetch_add(1, Ordering::SeqCst) < failures {
                    Err(JobError::failed(format!("{} not ready", name)))
                } else {
                    Ok(json!(name))
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_backoff_and_rejoins_at_tail() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10)).without_jitter();
        let queue = JobQueue::new(fast_config(), backoff);
        let log = StartLog::default();
        let work = Duration::from_millis(150);

        let retried = queue
            .queue_job(JobRequest::new("a", logged("a", 2, Duration::ZERO, log.clone())).max_retries(2))
            .unwrap();
        for name in ["b", "c", "d"] {
            queue
                .queue_job(JobRequest::new(name, logged(name, 0, work, log.clone())))
                .unwrap();
        }
        queue.start(1).unwrap();

        let record = wait_for_terminal(&queue, &retried).await;
        assert_eq!(record.status, JobStatus::Succeeded);
        assert_eq!(record.retry_count, 2);

        let log = log.lock().clone();
        let order: Vec<_> = log.iter().map(|(name, _)| *name).collect();
        // The first retry became ready while "d" was still pending; it runs after it.
        assert_eq!(order, vec!["a", "b", "c", "d", "a", "a"]);

        let starts: Vec<_> = log
            .iter()
            .filter(|(name, _)| *name == "a")
            .map(|(_, at)| *at)
            .collect();
        // delay(1) = 200ms, delay(2) = 400ms.
        assert!(starts[1] - starts[0] >= Duration::from_millis(200));
        let second_gap = starts[2] - starts[1];
        assert!(second_gap >= Duration::from_millis(400), "{second_gap:?}");
        assert!(second_gap < Duration::from_millis(430), "{second_gap:?}");
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_exhausted_job_dead_lettered_once() {
        let queue = queue();
        queue.start(2).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let job_id = queue
            .queue_job(JobRequest::new("doomed", flaky(u32::MAX, attempts.clone())).max_retries(2))
            .unwrap();
        let record = wait_for_terminal(&queue, &job_id).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.error.as_deref(), Some("attempt 3 failed"));

        // No further attempts once dead-lettered.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let dead = queue.dead_letter_jobs();
        assert_eq!(dead.len(), 1);
        assert!(dead.contains_key(&job_id));
        assert!(queue.shared.completed.get(&job_id).await.is_none());

        let metrics = queue.metrics().await;
        assert_eq!(metrics.dead_lettered, 1);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.succeeded, 0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let queue = queue();
        queue.start(1).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let job_id = queue
            .queue_job(JobRequest::new("once", flaky(1, attempts.clone())).max_retries(0))
            .unwrap();
        let record = wait_for_terminal(&queue, &job_id).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_runs_fallback() {
        let queue = queue();
        queue.start(1).unwrap();

        let job_id = queue
            .queue_job(
                JobRequest::new("render", sleeper(Duration::from_secs(5)))
                    .timeout(Duration::from_millis(20))
                    .fallback(job_fn(|_| async { Ok::<_, JobError>(json!("cached")) })),
            )
            .unwrap();
        let record = wait_for_terminal(&queue, &job_id).await;

        assert_eq!(record.status, JobStatus::Succeeded);
        assert_eq!(record.result, Some(json!("cached")));
        assert!(record.used_fallback);
        assert!(record.error.unwrap().contains("fallback executed"));

        let metrics = queue.metrics().await;
        assert_eq!(metrics.timeouts, 1);
        assert_eq!(metrics.fallbacks, 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_without_fallback_fails() {
        let queue = queue();
        queue.start(1).unwrap();

        let job_id = queue
            .queue_job(
                JobRequest::new("render", sleeper(Duration::from_secs(5)))
                    .timeout(Duration::from_millis(20))
                    .max_retries(0),
            )
            .unwrap();
        let record = wait_for_terminal(&queue, &job_id).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.unwrap().contains("timed out"));
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_failed_fallback_counts_as_failure() {
        let queue = queue();
        queue.start(1).unwrap();

        let job_id = queue
            .queue_job(
                JobRequest::new("render", sleeper(Duration::from_secs(5)))
                    .timeout(Duration::from_millis(20))
                    .max_retries(0)
                    .fallback(job_fn(|_| async { Err::<Value, _>(JobError::failed("cache miss")) })),
            )
            .unwrap();
        let record = wait_for_terminal(&queue, &job_id).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert!(!record.used_fallback);
        assert!(record.error.unwrap().contains("fallback failed: cache miss"));
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_job_fails() {
        let queue = queue();
        queue.start(1).unwrap();

        let job_id = queue
            .queue_job(JobRequest::new("panics", Arc::new(Panicker)).max_retries(0))
            .unwrap();
        let record = wait_for_terminal(&queue, &job_id).await;

        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.unwrap().contains("kaboom"));
        // The worker survived and still serves jobs.
        let attempts = Arc::new(AtomicU32::new(0));
        let next = queue
            .queue_job(JobRequest::new("ok", flaky(0, attempts)))
            .unwrap();
        assert_eq!(wait_for_terminal(&queue, &next).await.status, JobStatus::Succeeded);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let queue = JobQueue::new(
            QueueConfig {
                max_queue_size: 2,
                ..fast_config()
            },
            fast_backoff(),
        );
        let op = sleeper(Duration::ZERO);

        queue.queue_job(JobRequest::new("a", op.clone())).unwrap();
        queue.queue_job(JobRequest::new("b", op.clone())).unwrap();
        assert_eq!(
            queue.queue_job(JobRequest::new("c", op)),
            Err(QueueError::QueueFull { capacity: 2 })
        );

        let metrics = queue.metrics().await;
        assert_eq!(metrics.rejected, 1);
        assert_eq!(metrics.pending, 2);
    }

    #[tokio::test]
    async fn test_jobs_queued_before_start_run_after() {
        let queue = queue();
        let job_id = queue
            .queue_job(JobRequest::new("early", sleeper(Duration::ZERO)))
            .unwrap();
        assert_eq!(queue.get_status(&job_id).await, Some(JobStatus::Pending));

        queue.start(1).unwrap();
        assert_eq!(
            wait_for_terminal(&queue, &job_id).await.status,
            JobStatus::Succeeded
        );
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_stop_lets_running_job_finish() {
        let queue = queue();
        queue.start(1).unwrap();

        let job_id = queue
            .queue_job(JobRequest::new("slow", sleeper(Duration::from_millis(100))))
            .unwrap();
        for _ in 0..100 {
            if queue.get_status(&job_id).await == Some(JobStatus::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        queue.stop().await;
        assert!(!queue.is_running());
        assert_eq!(queue.get_status(&job_id).await, Some(JobStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let queue = queue();
        queue.start(1).unwrap();
        assert_eq!(queue.start(1), Err(QueueError::AlreadyRunning));
        assert_eq!(queue.metrics().await.workers, 1);
        queue.stop().await;

        assert_eq!(queue.start(0), Err(QueueError::NoWorkers));
    }

    #[tokio::test]
    async fn test_requeue_dead_letter() {
        let queue = queue();
        queue.start(1).unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let job_id = queue
            .queue_job(JobRequest::new("retry-me", flaky(1, attempts.clone())).max_retries(0))
            .unwrap();
        assert_eq!(
            wait_for_terminal(&queue, &job_id).await.status,
            JobStatus::Failed
        );

        queue.requeue_dead_letter(&job_id).unwrap();
        assert!(queue.dead_letter_jobs().is_empty());
        assert_eq!(
            wait_for_terminal(&queue, &job_id).await.status,
            JobStatus::Succeeded
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let queue = queue();
        let unknown = uuid::Uuid::new_v4();
        assert_eq!(queue.get_status(&unknown).await, None);
        assert_eq!(
            queue.requeue_dead_letter(&unknown),
            Err(QueueError::NotFound(unknown))
        );
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_workers() {
        let queue = queue();
        queue.start(2).unwrap();
        let current = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let op = {
            let current = current.clone();
            let peak = peak.clone();
            job_fn(move |_| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, JobError>(Value::Null)
                }
            })
        };

        let ids: Vec<_> = (0..6)
            .map(|i| queue.queue_job(JobRequest::new(format!("job-{i}"), op.clone())).unwrap())
            .collect();
        for id in &ids {
            wait_for_terminal(&queue, id).await;
        }

        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak concurrency {}", peak);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_terminal_jobs_land_in_exactly_one_place() {
        let queue = queue();
        queue.start(3).unwrap();

        let ids: Vec<_> = (0..8)
            .map(|i| {
                let attempts = Arc::new(AtomicU32::new(0));
                // Odd jobs never succeed.
                let failures = if i % 2 == 1 { u32::MAX } else { 1 };
                queue
                    .queue_job(JobRequest::new("mixed", flaky(failures, attempts)).max_retries(1))
                    .unwrap()
            })
            .collect();
        for id in &ids {
            wait_for_terminal(&queue, id).await;
        }

        let dead = queue.dead_letter_jobs();
        for id in &ids {
            let completed = queue.shared.completed.get(id).await.is_some();
            assert!(completed != dead.contains_key(id), "job {} in both or neither", id);
        }
        assert_eq!(dead.len(), 4);
        queue.stop().await;
    }
}
