//! Worker pool for processing jobs from Redis queues.
//!
//! This module provides a pool of workers that consume jobs from the Redis
//! broker. Each registered queue gets its own set of workers, and each
//! worker runs as an independent async task dispatching to the queue's
//! `JobHandler`.
//!
//! # Features
//!
//! - Configurable number of workers per queue
//! - Graceful shutdown with broadcast channel
//! - Retry with the job's backoff delay
//! - Dead letter queue for failed jobs
//! - Pool statistics tracking

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use redis::aio::MultiplexedConnection;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::{JobHandler, JobResult};
use super::queue::QueueError;
use super::redis_queue::{DequeuedJob, RedisJobQueue, DEFAULT_KEY_PREFIX};
use crate::metrics::MetricsCollector;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to connect to the job queue.
    #[error("Queue connection failed: {0}")]
    QueueConnection(#[from] QueueError),

    /// No handler registered, nothing to consume.
    #[error("No job handlers registered")]
    NoHandlers,

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn per registered queue.
    pub num_workers: usize,
    /// Redis connection URL.
    pub redis_url: String,
    /// Namespace for all Redis keys.
    pub key_prefix: String,
    /// How long a worker blocks waiting for a job before checking for shutdown.
    pub poll_interval: Duration,
    /// Per-attempt timeout for jobs that do not carry their own.
    pub job_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            poll_interval: Duration::from_secs(1),
            job_timeout: Duration::from_secs(1800), // 30 minutes
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Total number of jobs completed successfully.
    pub jobs_completed: u64,
    /// Total number of jobs that failed for good.
    pub jobs_failed: u64,
    /// Total number of attempts sent back for retry.
    pub jobs_retried: u64,
    /// Average attempt duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs settled (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    attempts: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_attempt(&self, duration: Duration) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_completion(&self) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
    }

    fn record_failure(&self) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
    }

    fn record_retry(&self) {
        self.jobs_retried.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let attempts = self.attempts.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let average_duration = if attempts > 0 {
            Duration::from_millis(total_duration_ms / attempts)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            jobs_completed: self.jobs_completed.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            jobs_retried: self.jobs_retried.load(Ordering::SeqCst),
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that manages workers consuming the registered queues.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<RedisJobQueue>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
    metrics: MetricsCollector,
}

impl WorkerPool {
    /// Creates a new worker pool connected to the configured Redis.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if queue connection fails.
    pub async fn new(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        let queue = RedisJobQueue::connect(&config.redis_url, &config.key_prefix).await?;
        Ok(Self::with_queue(config, Arc::new(queue)))
    }

    /// Creates a worker pool with an existing queue connection.
    ///
    /// Useful when the queue is shared with the orchestrator as producer.
    pub fn with_queue(config: WorkerPoolConfig, queue: Arc<RedisJobQueue>) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            handlers: HashMap::new(),
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
            metrics: MetricsCollector::new(),
        }
    }

    /// Registers the handler for jobs on `queue`.
    ///
    /// Takes effect on the next `start`.
    pub fn register_handler(&mut self, queue: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(queue.into(), handler);
    }

    /// Starts workers for every registered queue.
    ///
    /// Jobs left in processing lists by a previous crash are recovered first.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running,
    /// `PoolError::NoHandlers` when nothing was registered.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if self.handlers.is_empty() {
            return Err(PoolError::NoHandlers);
        }

        for (queue_name, handler) in &self.handlers {
            match self.queue.recover_processing_jobs(queue_name).await {
                Ok(recovered) if recovered > 0 => {
                    info!(
                        queue = %queue_name,
                        recovered = recovered,
                        "Recovered jobs from processing queue"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(queue = %queue_name, error = %e, "Failed to recover processing jobs");
                }
            }

            for i in 0..self.config.num_workers {
                let conn = self.queue.blocking_connection().await?;
                let worker = Worker {
                    id: format!("{}-worker-{}", queue_name, i),
                    queue_name: queue_name.clone(),
                    queue: Arc::clone(&self.queue),
                    handler: Arc::clone(handler),
                    conn,
                    shutdown_rx: self.shutdown_tx.subscribe(),
                    poll_interval: self.config.poll_interval,
                    job_timeout: self.config.job_timeout,
                    stats: Arc::clone(&self.stats),
                    metrics: self.metrics,
                };

                self.worker_handles.push(tokio::spawn(worker.run()));
            }
        }

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.update_workers(self.worker_handles.len());
        info!(
            queues = self.handlers.len(),
            workers_per_queue = self.config.num_workers,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Sends a shutdown signal to all workers and waits for them to finish
    /// their current jobs.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.worker_handles.drain(..).collect();
        let shutdown_future = async {
            for joined in join_all(handles).await {
                if let Err(e) = joined {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let outcome = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.update_workers(0);

        match outcome {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats
            .to_pool_stats(self.config.num_workers * self.handlers.len())
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Names of the queues this pool consumes.
    pub fn queues(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Returns a reference to the job queue.
    pub fn queue(&self) -> &Arc<RedisJobQueue> {
        &self.queue
    }
}

/// A single worker consuming one queue.
struct Worker {
    id: String,
    queue_name: String,
    queue: Arc<RedisJobQueue>,
    handler: Arc<dyn JobHandler>,
    /// Dedicated connection for BRPOPLPUSH.
    conn: MultiplexedConnection,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    job_timeout: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Continuously dequeues and processes jobs until a shutdown signal is
    /// received.
    async fn run(mut self) {
        info!(worker_id = %self.id, queue = %self.queue_name, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let queue = Arc::clone(&self.queue);
            match queue
                .dequeue(&mut self.conn, &self.queue_name, self.poll_interval)
                .await
            {
                Ok(Some(dequeued)) => self.process_job(dequeued).await,
                Ok(None) => {
                    debug!(worker_id = %self.id, "No jobs available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Runs one attempt of a job and settles, retries or dead-letters it.
    async fn process_job(&self, mut dequeued: DequeuedJob) {
        dequeued.job.increment_attempts();
        let job_id = dequeued.job.id;
        let attempt = dequeued.job.attempts;
        let timeout = dequeued.job.options.timeout().unwrap_or(self.job_timeout);

        info!(
            worker_id = %self.id,
            job_id = %job_id,
            name = %dequeued.job.name,
            attempt = attempt,
            "Processing job"
        );

        self.stats.increment_active();
        self.metrics.inc_jobs_in_progress();
        let start_time = Instant::now();

        let outcome = tokio::time::timeout(timeout, self.handler.handle(&dequeued.job)).await;

        let duration = start_time.elapsed();
        let duration_ms = duration.as_millis() as u64;
        self.stats.record_attempt(duration);
        self.stats.decrement_active();
        self.metrics.dec_jobs_in_progress();

        let (failure, retryable) = match outcome {
            Ok(Ok(output)) => {
                let result = JobResult::success(&dequeued.job, &self.id, output, duration_ms);
                if let Err(e) = self.queue.complete(&dequeued, &result).await {
                    error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to mark job complete");
                }
                self.stats.record_completion();
                self.metrics.record_job_attempt(&self.queue_name, "success");
                info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    duration_ms = duration_ms,
                    "Job completed successfully"
                );
                return;
            }
            Ok(Err(e)) => (
                JobResult::failure(&dequeued.job, &self.id, e.message, duration_ms),
                e.retryable,
            ),
            Err(_) => (
                JobResult::timeout(&dequeued.job, &self.id, duration_ms),
                true,
            ),
        };

        if retryable && dequeued.job.should_retry() {
            let delay = dequeued.job.next_retry_delay();
            self.stats.record_retry();
            self.metrics.record_job_attempt(&self.queue_name, "retry");
            warn!(
                worker_id = %self.id,
                job_id = %job_id,
                error = ?failure.error,
                remaining_attempts = dequeued.job.remaining_attempts(),
                delay_ms = delay.as_millis() as u64,
                "Job failed, requeueing for retry"
            );

            // The job stays in the processing list during the delay, so a
            // crash here is picked up by recovery.
            let queue = Arc::clone(&self.queue);
            let worker_id = self.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = queue.requeue(&dequeued).await {
                    error!(worker_id = %worker_id, job_id = %job_id, error = %e, "Failed to requeue job");
                }
            });
        } else {
            self.stats.record_failure();
            self.metrics.record_job_attempt(&self.queue_name, "failure");
            error!(
                worker_id = %self.id,
                job_id = %job_id,
                status = %failure.status,
                error = ?failure.error,
                attempts = attempt,
                "Job failed, moving to dead letter queue"
            );

            if let Err(e) = self.queue.dead_letter(&dequeued, &failure).await {
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    error = %e,
                    "Failed to move job to dead letter queue"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 4);
        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.key_prefix, "task_forge");
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.job_timeout, Duration::from_secs(1800));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_redis_url("redis://custom:6380")
            .with_key_prefix("tenant_a")
            .with_poll_interval(Duration::from_secs(5))
            .with_job_timeout(Duration::from_secs(3600))
            .with_shutdown_timeout(Duration::from_secs(120));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.redis_url, "redis://custom:6380");
        assert_eq!(config.key_prefix, "tenant_a");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.job_timeout, Duration::from_secs(3600));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();

        assert_eq!(stats.total_processed(), 0);
        assert_eq!(stats.jobs_retried, 0);
        assert!((stats.success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            jobs_completed: 80,
            jobs_failed: 20,
            jobs_retried: 7,
            average_job_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats_averages_attempts() {
        let stats = SharedPoolStats::new();

        stats.record_attempt(Duration::from_secs(10));
        stats.record_retry();
        stats.record_attempt(Duration::from_secs(20));
        stats.record_completion();
        stats.record_attempt(Duration::from_secs(5));
        stats.record_failure();

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.jobs_completed, 1);
        assert_eq!(pool_stats.jobs_failed, 1);
        assert_eq!(pool_stats.jobs_retried, 1);
        // (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
    }

    #[test]
    fn test_shared_pool_stats_active_workers() {
        let stats = SharedPoolStats::new();

        stats.increment_active();
        stats.increment_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 2);

        stats.decrement_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_error_display() {
        assert!(PoolError::AlreadyRunning
            .to_string()
            .contains("already running"));
        assert!(PoolError::NotRunning.to_string().contains("not running"));
        assert!(PoolError::NoHandlers.to_string().contains("handlers"));
        assert!(PoolError::ShutdownTimeout(Duration::from_secs(60))
            .to_string()
            .contains("60"));
    }
}
