//! In-process job queue.
//!
//! Every enqueued job is driven by its own tokio task: attempts run through
//! the handler registered for the job's queue, failed attempts sleep for the
//! job's backoff delay, and the settled outcome is published on a `watch`
//! channel that `await_result` waits on.
//!
//! Settled jobs stay readable (result, progress, attempts) until more than
//! `settled_retention` newer jobs have settled; the oldest are then released
//! and their handles report `JobNotFound`. Unsettled jobs are never released.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::job::{Job, JobError, JobHandle, JobHandler, JobOptions, JobProgress, ProgressUpdate};
use super::queue::{JobQueue, QueueError};
use crate::metrics::MetricsCollector;

/// Settlement state of one job.
#[derive(Debug, Clone)]
enum Outcome {
    Pending,
    Completed(Value),
    Failed { attempts: u32, message: String },
}

struct JobEntry {
    outcome: watch::Receiver<Outcome>,
    progress: Option<JobProgress>,
    attempts: Arc<AtomicU32>,
}

/// Settled jobs kept by default before the oldest are released.
pub const DEFAULT_SETTLED_RETENTION: usize = 1024;

#[derive(Default)]
struct JobTable {
    entries: HashMap<Uuid, JobEntry>,
    /// Settled job ids, oldest first.
    settled: VecDeque<Uuid>,
}

impl JobTable {
    /// Marks `job_id` settled and drops the oldest settled entries beyond
    /// `retention`. Returns how many were dropped.
    fn settle(&mut self, job_id: Uuid, retention: usize) -> usize {
        self.settled.push_back(job_id);
        let mut released = 0;
        while self.settled.len() > retention {
            if let Some(oldest) = self.settled.pop_front() {
                self.entries.remove(&oldest);
                released += 1;
            }
        }
        released
    }
}

/// Where a job task publishes its final outcome.
struct Settlement {
    table: Arc<RwLock<JobTable>>,
    retention: usize,
    outcome: watch::Sender<Outcome>,
}

impl Settlement {
    /// Books the job as settled, then wakes its waiters.
    async fn publish(self, job_id: Uuid, outcome: Outcome) {
        let released = self.table.write().await.settle(job_id, self.retention);
        if released > 0 {
            debug!(released = released, "Released settled jobs");
        }
        let _ = self.outcome.send(outcome);
    }
}

/// Job queue backed by tokio tasks, for tests and single-process deployments.
pub struct InMemoryJobQueue {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    jobs: Arc<RwLock<JobTable>>,
    settled_retention: usize,
    metrics: MetricsCollector,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self {
            handlers: RwLock::default(),
            jobs: Arc::default(),
            settled_retention: DEFAULT_SETTLED_RETENTION,
            metrics: MetricsCollector::default(),
        }
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `retention` settled jobs (at least one).
    pub fn with_settled_retention(mut self, retention: usize) -> Self {
        self.settled_retention = retention.max(1);
        self
    }

    /// Registers the handler that consumes jobs submitted to `queue`.
    ///
    /// Replaces any handler previously registered for the same queue.
    pub async fn register_handler(&self, queue: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.write().await.insert(queue.into(), handler);
    }

    /// Number of jobs held: every unsettled job plus the retained settled ones.
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.entries.len()
    }

    async fn run_job(
        mut job: Job,
        handler: Arc<dyn JobHandler>,
        settlement: Settlement,
        attempts: Arc<AtomicU32>,
        metrics: MetricsCollector,
    ) {
        loop {
            job.increment_attempts();
            attempts.store(job.attempts, Ordering::SeqCst);

            let started = Instant::now();
            metrics.inc_jobs_in_progress();
            let result = match job.options.timeout() {
                Some(limit) => tokio::time::timeout(limit, handler.handle(&job))
                    .await
                    .unwrap_or_else(|_| {
                        Err(JobError::retryable(format!(
                            "Job timed out after {}ms",
                            limit.as_millis()
                        )))
                    }),
                None => handler.handle(&job).await,
            };
            metrics.dec_jobs_in_progress();

            match result {
                Ok(value) => {
                    metrics.record_job_attempt(&job.queue, "success");
                    debug!(
                        job_id = %job.id,
                        queue = %job.queue,
                        attempt = job.attempts,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Job completed"
                    );
                    settlement.publish(job.id, Outcome::Completed(value)).await;
                    return;
                }
                Err(e) if e.retryable && job.should_retry() => {
                    metrics.record_job_attempt(&job.queue, "retry");
                    let delay = job.next_retry_delay();
                    warn!(
                        job_id = %job.id,
                        queue = %job.queue,
                        attempt = job.attempts,
                        remaining = job.remaining_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Job attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    metrics.record_job_attempt(&job.queue, "failure");
                    warn!(
                        job_id = %job.id,
                        queue = %job.queue,
                        attempts = job.attempts,
                        error = %e,
                        "Job failed"
                    );
                    settlement
                        .publish(
                            job.id,
                            Outcome::Failed {
                                attempts: job.attempts,
                                message: e.message,
                            },
                        )
                        .await;
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobHandle, QueueError> {
        let handler = self
            .handlers
            .read()
            .await
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::NoHandler(queue.to_string()))?;

        let job = Job::new(queue, name, payload, options);
        let handle = job.handle();
        let (tx, rx) = watch::channel(Outcome::Pending);
        let attempts = Arc::new(AtomicU32::new(0));

        self.jobs.write().await.entries.insert(
            job.id,
            JobEntry {
                outcome: rx,
                progress: None,
                attempts: attempts.clone(),
            },
        );

        debug!(job_id = %job.id, queue = queue, name = name, "Job enqueued");
        let settlement = Settlement {
            table: self.jobs.clone(),
            retention: self.settled_retention,
            outcome: tx,
        };
        tokio::spawn(Self::run_job(job, handler, settlement, attempts, self.metrics));

        Ok(handle)
    }

    async fn await_result(&self, handle: &JobHandle) -> Result<Value, QueueError> {
        let mut rx = self
            .jobs
            .read()
            .await
            .entries
            .get(&handle.id)
            .map(|entry| entry.outcome.clone())
            .ok_or(QueueError::JobNotFound(handle.id))?;

        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                Outcome::Completed(value) => return Ok(value),
                Outcome::Failed { attempts, message } => {
                    return Err(QueueError::JobFailed {
                        job_id: handle.id,
                        attempts,
                        message,
                    })
                }
                Outcome::Pending => {}
            }
            rx.changed().await.map_err(|_| QueueError::Closed)?;
        }
    }

    async fn update_progress(
        &self,
        handle: &JobHandle,
        update: ProgressUpdate,
    ) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .entries
            .get_mut(&handle.id)
            .ok_or(QueueError::JobNotFound(handle.id))?;
        entry
            .progress
            .get_or_insert_with(JobProgress::default)
            .apply(update);
        Ok(())
    }

    async fn progress(&self, handle: &JobHandle) -> Result<Option<JobProgress>, QueueError> {
        self.jobs
            .read()
            .await
            .entries
            .get(&handle.id)
            .map(|entry| entry.progress.clone())
            .ok_or(QueueError::JobNotFound(handle.id))
    }

    async fn attempts(&self, handle: &JobHandle) -> Result<Option<u32>, QueueError> {
        self.jobs
            .read()
            .await
            .entries
            .get(&handle.id)
            .map(|entry| Some(entry.attempts.load(Ordering::SeqCst)))
            .ok_or(QueueError::JobNotFound(handle.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::BackoffPolicy;
    use serde_json::json;
    use std::time::Duration;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn handle(&self, job: &Job) -> Result<Value, JobError> {
            Ok(json!({ "echo": job.payload, "attempt": job.attempts }))
        }
    }

    /// Fails the first `failures` attempts, then succeeds.
    struct FlakyHandler {
        failures: u32,
        calls: AtomicU32,
        retryable: bool,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, _job: &Job) -> Result<Value, JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                let msg = format!("failure {}", call);
                return Err(if self.retryable {
                    JobError::retryable(msg)
                } else {
                    JobError::fatal(msg)
                });
            }
            Ok(json!({ "calls": call }))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, _job: &Job) -> Result<Value, JobError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    fn fast_retry(attempts: u32) -> JobOptions {
        JobOptions::new()
            .with_attempts(attempts)
            .with_backoff(BackoffPolicy::exponential(1, 2.0, 5))
    }

    #[tokio::test]
    async fn test_enqueue_and_await() {
        let queue = InMemoryJobQueue::new();
        queue.register_handler("echo", Arc::new(EchoHandler)).await;

        let handle = queue
            .enqueue("echo", "run", json!({"x": 1}), JobOptions::new())
            .await
            .unwrap();
        let value = queue.await_result(&handle).await.unwrap();

        assert_eq!(value["echo"]["x"], 1);
        assert_eq!(value["attempt"], 1);
        assert_eq!(queue.attempts(&handle).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_enqueue_without_handler_fails() {
        let queue = InMemoryJobQueue::new();
        let err = queue
            .enqueue("missing", "run", Value::Null, JobOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::NoHandler(ref q) if q == "missing"));
        assert_eq!(queue.job_count().await, 0);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let queue = InMemoryJobQueue::new();
        let handler = Arc::new(FlakyHandler {
            failures: 2,
            calls: AtomicU32::new(0),
            retryable: true,
        });
        queue.register_handler("flaky", handler.clone()).await;

        let handle = queue
            .enqueue("flaky", "run", Value::Null, fast_retry(3))
            .await
            .unwrap();
        let value = queue.await_result(&handle).await.unwrap();

        assert_eq!(value["calls"], 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_report_last_error() {
        let queue = InMemoryJobQueue::new();
        let handler = Arc::new(FlakyHandler {
            failures: 10,
            calls: AtomicU32::new(0),
            retryable: true,
        });
        queue.register_handler("flaky", handler.clone()).await;

        let handle = queue
            .enqueue("flaky", "run", Value::Null, fast_retry(3))
            .await
            .unwrap();
        let err = queue.await_result(&handle).await.unwrap_err();

        match err {
            QueueError::JobFailed {
                attempts, message, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(message, "failure 3");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_skips_remaining_attempts() {
        let queue = InMemoryJobQueue::new();
        let handler = Arc::new(FlakyHandler {
            failures: 10,
            calls: AtomicU32::new(0),
            retryable: false,
        });
        queue.register_handler("flaky", handler.clone()).await;

        let handle = queue
            .enqueue("flaky", "run", Value::Null, fast_retry(5))
            .await
            .unwrap();
        let err = queue.await_result(&handle).await.unwrap_err();

        assert!(err.is_job_failure());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let queue = InMemoryJobQueue::new();
        queue.register_handler("slow", Arc::new(SlowHandler)).await;

        let options = fast_retry(2).with_timeout_ms(10);
        let handle = queue
            .enqueue("slow", "run", Value::Null, options)
            .await
            .unwrap();
        let err = queue.await_result(&handle).await.unwrap_err();

        assert!(err.to_string().contains("timed out"));
        assert_eq!(queue.attempts(&handle).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_await_is_repeatable_after_settlement() {
        let queue = InMemoryJobQueue::new();
        queue.register_handler("echo", Arc::new(EchoHandler)).await;

        let handle = queue
            .enqueue("echo", "run", json!(7), JobOptions::new())
            .await
            .unwrap();
        let first = queue.await_result(&handle).await.unwrap();
        let second = queue.await_result(&handle).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_progress_updates_merge() {
        let queue = InMemoryJobQueue::new();
        queue.register_handler("echo", Arc::new(EchoHandler)).await;
        let handle = queue
            .enqueue("echo", "run", Value::Null, JobOptions::new())
            .await
            .unwrap();

        assert_eq!(queue.progress(&handle).await.unwrap(), None);

        queue
            .update_progress(&handle, ProgressUpdate::percent(33))
            .await
            .unwrap();
        queue
            .update_progress(&handle, ProgressUpdate::pause())
            .await
            .unwrap();

        let progress = queue.progress(&handle).await.unwrap().unwrap();
        assert_eq!(progress.percent, 33);
        assert!(progress.paused);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let queue = InMemoryJobQueue::new();
        let handle = JobHandle {
            id: Uuid::new_v4(),
            queue: "echo".to_string(),
            name: "run".to_string(),
        };

        assert!(matches!(
            queue.await_result(&handle).await,
            Err(QueueError::JobNotFound(_))
        ));
        assert!(matches!(
            queue.update_progress(&handle, ProgressUpdate::percent(1)).await,
            Err(QueueError::JobNotFound(_))
        ));
    }

    /// Holds every job until a permit is added.
    struct GatedHandler {
        gate: Arc<tokio::sync::Semaphore>,
    }

    #[async_trait]
    impl JobHandler for GatedHandler {
        async fn handle(&self, _job: &Job) -> Result<Value, JobError> {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| JobError::fatal(e.to_string()))?;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_settled_jobs_are_released_beyond_retention() {
        let queue = InMemoryJobQueue::new().with_settled_retention(2);
        queue.register_handler("echo", Arc::new(EchoHandler)).await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let handle = queue
                .enqueue("echo", "run", json!(i), JobOptions::new())
                .await
                .unwrap();
            queue.await_result(&handle).await.unwrap();
            handles.push(handle);
        }

        assert_eq!(queue.job_count().await, 2);
        assert!(matches!(
            queue.await_result(&handles[0]).await,
            Err(QueueError::JobNotFound(_))
        ));
        assert!(matches!(
            queue.progress(&handles[2]).await,
            Err(QueueError::JobNotFound(_))
        ));
        assert_eq!(queue.attempts(&handles[3]).await.unwrap(), Some(1));
        assert_eq!(
            queue.await_result(&handles[4]).await.unwrap(),
            json!({"echo": 4, "attempt": 1})
        );
    }

    #[tokio::test]
    async fn test_unsettled_jobs_are_never_released() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let queue = InMemoryJobQueue::new().with_settled_retention(1);
        queue
            .register_handler("gated", Arc::new(GatedHandler { gate: gate.clone() }))
            .await;
        queue.register_handler("echo", Arc::new(EchoHandler)).await;

        let held = queue
            .enqueue("gated", "run", Value::Null, JobOptions::new())
            .await
            .unwrap();
        for i in 0..3 {
            let handle = queue
                .enqueue("echo", "run", json!(i), JobOptions::new())
                .await
                .unwrap();
            queue.await_result(&handle).await.unwrap();
        }

        assert_eq!(queue.job_count().await, 2);
        queue
            .update_progress(&held, ProgressUpdate::percent(50))
            .await
            .unwrap();

        gate.add_permits(1);
        assert_eq!(queue.await_result(&held).await.unwrap(), Value::Null);
        assert_eq!(queue.job_count().await, 1);
    }

    #[test]
    fn test_zero_retention_keeps_latest_settled_job() {
        let queue = InMemoryJobQueue::new().with_settled_retention(0);
        assert_eq!(queue.settled_retention, 1);
    }
}
