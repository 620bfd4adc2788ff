//! Redis-based job queue with reliable dequeue.
//!
//! # Key Layout
//!
//! For every logical queue `{prefix}:{queue}` there are three lists:
//!
//! - `{prefix}:{queue}`: Main queue where jobs are enqueued
//! - `{prefix}:{queue}:processing`: Jobs being processed (for crash recovery)
//! - `{prefix}:{queue}:dead_letter`: Jobs that failed after max attempts
//!
//! and per job:
//!
//! - `{prefix}:job:{id}:result`: Final `JobResult`
//! - `{prefix}:job:{id}:done`: Completion list producers block on with BLPOP
//! - `{prefix}:job:{id}:progress`: `JobProgress` hash (`percent`, `paused`, `checkpointId`)
//!
//! # Reliability
//!
//! Jobs are atomically moved from the main queue to the processing queue when
//! dequeued. If a worker crashes, jobs in the processing queue are recovered
//! and requeued by the next `WorkerPool` start.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::job::{Job, JobHandle, JobOptions, JobProgress, JobResult, ProgressUpdate};
use super::queue::{JobQueue, QueueError, QueueStats};

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "task_forge";

/// Results, completion lists and progress expire after 7 days.
const RESULT_TTL_SECS: u64 = 604_800;

/// Upper bound on a single BLPOP while awaiting a result.
const AWAIT_BLOCK_SECS: u64 = 5;

/// A job popped from a main queue together with its exact stored form.
///
/// The raw payload is what sits in the processing list, so removal does not
/// depend on re-serializing the job after its attempt counter changed.
#[derive(Debug, Clone)]
pub struct DequeuedJob {
    pub job: Job,
    raw: String,
}

/// Redis-backed implementation of `JobQueue`.
pub struct RedisJobQueue {
    /// Used to open dedicated connections for blocking commands.
    client: redis::Client,
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    prefix: String,
}

impl RedisJobQueue {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - Namespace for every key this queue touches
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            prefix: prefix.to_string(),
        })
    }

    /// Opens a connection reserved for blocking commands.
    ///
    /// BRPOPLPUSH and BLPOP stall every request multiplexed on the same
    /// connection, so they never run on the shared manager.
    pub async fn blocking_connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:{}", self.prefix, queue)
    }

    fn processing_key(&self, queue: &str) -> String {
        format!("{}:{}:processing", self.prefix, queue)
    }

    fn dead_letter_key(&self, queue: &str) -> String {
        format!("{}:{}:dead_letter", self.prefix, queue)
    }

    fn result_key(&self, job_id: Uuid) -> String {
        format!("{}:job:{}:result", self.prefix, job_id)
    }

    fn done_key(&self, job_id: Uuid) -> String {
        format!("{}:job:{}:done", self.prefix, job_id)
    }

    fn progress_key(&self, job_id: Uuid) -> String {
        format!("{}:job:{}:progress", self.prefix, job_id)
    }

    /// Pushes a job onto its queue.
    ///
    /// Jobs are added to the left of the queue (LPUSH) so they can be
    /// dequeued from the right in FIFO order.
    pub async fn push(&self, job: &Job) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.queue_key(&job.queue), serialized)
            .await?;
        Ok(())
    }

    /// Dequeues the next job of `queue`, blocking until one is available or
    /// `timeout` expires.
    ///
    /// Uses BRPOPLPUSH to atomically move the job from the main queue to the
    /// processing queue.
    pub async fn dequeue(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<DequeuedJob>, QueueError> {
        let timeout_secs = timeout.as_secs().max(1);

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(self.queue_key(queue))
            .arg(self.processing_key(queue))
            .arg(timeout_secs)
            .query_async(conn)
            .await?;

        match result {
            Some(raw) => {
                let job: Job = serde_json::from_str(&raw)?;
                Ok(Some(DequeuedJob { job, raw }))
            }
            None => Ok(None),
        }
    }

    /// Publishes the final result of a successful job and releases it from
    /// the processing queue.
    pub async fn complete(
        &self,
        dequeued: &DequeuedJob,
        result: &JobResult,
    ) -> Result<(), QueueError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(self.processing_key(&dequeued.job.queue))
            .arg(1)
            .arg(&dequeued.raw)
            .ignore();
        self.add_publish(&mut pipe, result)?;

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Returns a job to the head of its queue for another attempt.
    ///
    /// The job's attempt counter should be incremented before calling this.
    pub async fn requeue(&self, dequeued: &DequeuedJob) -> Result<(), QueueError> {
        let queue = &dequeued.job.queue;
        let serialized = serde_json::to_string(&dequeued.job)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(self.processing_key(queue))
            .arg(1)
            .arg(&dequeued.raw)
            .ignore()
            .cmd("RPUSH")
            .arg(self.queue_key(queue))
            .arg(serialized)
            .ignore();

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Moves a job to the dead letter queue and publishes its failure.
    pub async fn dead_letter(
        &self,
        dequeued: &DequeuedJob,
        result: &JobResult,
    ) -> Result<(), QueueError> {
        let queue = &dequeued.job.queue;
        let entry = serde_json::json!({
            "job": dequeued.job,
            "error": result.error,
            "moved_at": chrono::Utc::now().to_rfc3339(),
        });

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(self.processing_key(queue))
            .arg(1)
            .arg(&dequeued.raw)
            .ignore()
            .cmd("LPUSH")
            .arg(self.dead_letter_key(queue))
            .arg(serde_json::to_string(&entry)?)
            .ignore();
        self.add_publish(&mut pipe, result)?;

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    fn add_publish(&self, pipe: &mut redis::Pipeline, result: &JobResult) -> Result<(), QueueError> {
        let data = serde_json::to_string(result)?;
        let result_key = self.result_key(result.job_id);
        let done_key = self.done_key(result.job_id);

        pipe.cmd("SET")
            .arg(&result_key)
            .arg(&data)
            .arg("EX")
            .arg(RESULT_TTL_SECS)
            .ignore()
            .cmd("LPUSH")
            .arg(&done_key)
            .arg(&data)
            .ignore()
            .cmd("EXPIRE")
            .arg(&done_key)
            .arg(RESULT_TTL_SECS)
            .ignore();
        Ok(())
    }

    /// Retrieves a job result by job ID.
    pub async fn get_result(&self, job_id: Uuid) -> Result<Option<JobResult>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(self.result_key(job_id)).await?;

        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Returns the number of jobs waiting in `queue`.
    pub async fn len(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.queue_key(queue)).await?;
        Ok(len)
    }

    /// Returns the number of jobs of `queue` currently being processed.
    pub async fn processing_len(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.processing_key(queue)).await?;
        Ok(len)
    }

    /// Returns the number of jobs in the dead letter queue of `queue`.
    pub async fn dead_letter_len(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.dead_letter_key(queue)).await?;
        Ok(len)
    }

    /// Recovers jobs stuck in the processing queue.
    ///
    /// This should be called on worker startup to recover jobs from
    /// workers that crashed. Returns the number of jobs moved back to the
    /// main queue.
    pub async fn recover_processing_jobs(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let mut recovered = 0;

        let jobs: Vec<String> = conn.lrange(self.processing_key(queue), 0, -1).await?;

        for raw in jobs {
            let Ok(mut job) = serde_json::from_str::<Job>(&raw) else {
                continue;
            };

            // The interrupted attempt counts against the budget
            job.increment_attempts();
            let dequeued = DequeuedJob { job, raw };

            if dequeued.job.should_retry() {
                self.requeue(&dequeued).await?;
                recovered += 1;
            } else {
                let result = JobResult::failure(
                    &dequeued.job,
                    "recovery",
                    "Recovered from processing queue after max attempts",
                    0,
                );
                self.dead_letter(&dequeued, &result).await?;
            }
        }

        Ok(recovered)
    }

    /// Clears the main, processing and dead letter lists of `queue`.
    ///
    /// **Warning**: This permanently deletes all jobs. Use with caution.
    pub async fn clear(&self, queue: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.del(self.queue_key(queue))
            .del(self.processing_key(queue))
            .del(self.dead_letter_key(queue));
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    /// Returns statistics for `queue`.
    pub async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let (pending, processing, dead) = tokio::try_join!(
            self.len(queue),
            self.processing_len(queue),
            self.dead_letter_len(queue)
        )?;

        Ok(QueueStats {
            queue_name: queue.to_string(),
            pending_jobs: pending,
            processing_jobs: processing,
            dead_letter_jobs: dead,
        })
    }

    /// Peeks at jobs in the dead letter queue without removing them.
    pub async fn peek_dead_letter(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<Value>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(self.dead_letter_key(queue), 0, limit as isize - 1)
            .await?;

        let entries: Result<Vec<Value>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();

        Ok(entries?)
    }

    fn settle(handle: &JobHandle, result: JobResult) -> Result<Value, QueueError> {
        if result.is_success() {
            Ok(result.output.unwrap_or(Value::Null))
        } else {
            Err(QueueError::JobFailed {
                job_id: handle.id,
                attempts: result.attempts,
                message: result
                    .error
                    .unwrap_or_else(|| format!("Job {}", result.status)),
            })
        }
    }
}

const PROGRESS_PERCENT: &str = "percent";
const PROGRESS_PAUSED: &str = "paused";
const PROGRESS_CHECKPOINT: &str = "checkpointId";

/// Hash fields written and deleted by one progress update.
///
/// Values are JSON scalars. A signal without a checkpoint id clears the
/// stored one, matching `JobProgress::apply`.
fn progress_fields(
    update: &ProgressUpdate,
) -> Result<(Vec<(&'static str, String)>, Vec<&'static str>), QueueError> {
    match update {
        ProgressUpdate::Percent { value } => Ok((
            vec![(PROGRESS_PERCENT, serde_json::to_string(&(*value).min(100))?)],
            Vec::new(),
        )),
        ProgressUpdate::Signal {
            paused,
            checkpoint_id,
        } => {
            let mut writes = vec![(PROGRESS_PAUSED, serde_json::to_string(paused)?)];
            let mut deletes = Vec::new();
            match checkpoint_id {
                Some(id) => writes.push((PROGRESS_CHECKPOINT, serde_json::to_string(id)?)),
                None => deletes.push(PROGRESS_CHECKPOINT),
            }
            Ok((writes, deletes))
        }
    }
}

/// Rebuilds `JobProgress` from its hash; an empty hash means no progress yet.
fn progress_from_fields(fields: &HashMap<String, String>) -> Result<Option<JobProgress>, QueueError> {
    if fields.is_empty() {
        return Ok(None);
    }

    let mut progress = JobProgress::default();
    if let Some(raw) = fields.get(PROGRESS_PERCENT) {
        progress.percent = serde_json::from_str(raw)?;
    }
    if let Some(raw) = fields.get(PROGRESS_PAUSED) {
        progress.paused = serde_json::from_str(raw)?;
    }
    if let Some(raw) = fields.get(PROGRESS_CHECKPOINT) {
        progress.checkpoint_id = Some(serde_json::from_str(raw)?);
    }
    Ok(Some(progress))
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobHandle, QueueError> {
        let job = Job::new(queue, name, payload, options);
        self.push(&job).await?;
        debug!(job_id = %job.id, queue = queue, name = name, "Job enqueued");
        Ok(job.handle())
    }

    async fn await_result(&self, handle: &JobHandle) -> Result<Value, QueueError> {
        let done_key = self.done_key(handle.id);
        let mut conn = self.blocking_connection().await?;

        loop {
            if let Some(result) = self.get_result(handle.id).await? {
                return Self::settle(handle, result);
            }

            let popped: Option<(String, String)> = redis::cmd("BLPOP")
                .arg(&done_key)
                .arg(AWAIT_BLOCK_SECS)
                .query_async(&mut conn)
                .await?;

            if let Some((_, data)) = popped {
                // Put the marker back so other waiters on the same job wake too
                let mut shared = self.redis.clone();
                shared.lpush::<_, _, ()>(&done_key, &data).await?;

                let result: JobResult = serde_json::from_str(&data)?;
                return Self::settle(handle, result);
            }
        }
    }

    async fn update_progress(
        &self,
        handle: &JobHandle,
        update: ProgressUpdate,
    ) -> Result<(), QueueError> {
        let key = self.progress_key(handle.id);
        let (writes, deletes) = progress_fields(&update)?;

        // Percent and signal updates write disjoint fields
        let mut pipe = redis::pipe();
        pipe.atomic().hset_multiple(&key, &writes).ignore();
        for field in deletes {
            pipe.hdel(&key, field).ignore();
        }
        pipe.cmd("EXPIRE").arg(&key).arg(RESULT_TTL_SECS).ignore();

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn progress(&self, handle: &JobHandle) -> Result<Option<JobProgress>, QueueError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.progress_key(handle.id)).await?;
        progress_from_fields(&fields)
    }

    async fn attempts(&self, handle: &JobHandle) -> Result<Option<u32>, QueueError> {
        Ok(self.get_result(handle.id).await?.map(|r| r.attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{job_names, queues};
    use serde_json::json;

    fn create_test_job() -> Job {
        Job::new(
            queues::DECOMPOSITION,
            job_names::DECOMPOSE,
            json!({"taskId": "t-1"}),
            JobOptions::new(),
        )
    }

    #[test]
    fn test_settle_success_returns_output() {
        let mut job = create_test_job();
        job.increment_attempts();
        let handle = job.handle();
        let result = JobResult::success(&job, "worker-0", json!({"subtasks": []}), 5);

        let value = RedisJobQueue::settle(&handle, result).unwrap();
        assert_eq!(value, json!({"subtasks": []}));
    }

    #[test]
    fn test_settle_failure_carries_attempts() {
        let mut job = create_test_job();
        job.increment_attempts();
        job.increment_attempts();
        let handle = job.handle();
        let result = JobResult::failure(&job, "worker-0", "decomposer down", 5);

        match RedisJobQueue::settle(&handle, result) {
            Err(QueueError::JobFailed {
                attempts, message, ..
            }) => {
                assert_eq!(attempts, 2);
                assert_eq!(message, "decomposer down");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    /// Applies updates the way Redis would: HSET the writes, HDEL the deletes.
    fn apply_fields(fields: &mut HashMap<String, String>, update: &ProgressUpdate) {
        let (writes, deletes) = progress_fields(update).unwrap();
        for (field, value) in writes {
            fields.insert(field.to_string(), value);
        }
        for field in deletes {
            fields.remove(field);
        }
    }

    #[test]
    fn test_progress_fields_are_disjoint_per_update_kind() {
        let (percent_writes, percent_deletes) =
            progress_fields(&ProgressUpdate::percent(66)).unwrap();
        assert_eq!(percent_writes, vec![(PROGRESS_PERCENT, "66".to_string())]);
        assert!(percent_deletes.is_empty());

        let (signal_writes, _) = progress_fields(&ProgressUpdate::pause()).unwrap();
        assert!(signal_writes
            .iter()
            .all(|(field, _)| *field != PROGRESS_PERCENT));
    }

    #[test]
    fn test_percent_update_after_pause_keeps_pause_flag() {
        // Order in which a control loop and a pause caller can land
        let mut fields = HashMap::new();
        apply_fields(&mut fields, &ProgressUpdate::percent(33));
        apply_fields(&mut fields, &ProgressUpdate::pause());
        apply_fields(&mut fields, &ProgressUpdate::percent(66));

        let progress = progress_from_fields(&fields).unwrap().unwrap();
        assert_eq!(progress.percent, 66);
        assert!(progress.paused);
        assert_eq!(progress.checkpoint_id, None);
    }

    #[test]
    fn test_progress_fields_match_in_memory_merge() {
        let updates = [
            ProgressUpdate::pause(),
            ProgressUpdate::percent(150),
            ProgressUpdate::resume(Some("cp-1".into())),
            ProgressUpdate::percent(100),
        ];

        let mut fields = HashMap::new();
        let mut merged = JobProgress::default();
        for update in updates {
            apply_fields(&mut fields, &update);
            merged.apply(update);
            assert_eq!(progress_from_fields(&fields).unwrap().unwrap(), merged);
        }
    }

    #[test]
    fn test_empty_progress_hash_is_none() {
        assert_eq!(progress_from_fields(&HashMap::new()).unwrap(), None);
    }

    #[test]
    fn test_dead_letter_entry_structure() {
        let job = create_test_job();
        let entry = serde_json::json!({
            "job": job,
            "error": "Test error message",
            "moved_at": chrono::Utc::now().to_rfc3339(),
        });

        let serialized = serde_json::to_string(&entry).expect("entry should serialize");
        let parsed: Value = serde_json::from_str(&serialized).expect("should parse back");

        assert!(parsed.get("job").is_some());
        assert!(parsed.get("error").is_some());
        assert!(parsed.get("moved_at").is_some());
    }

    // Requires a running Redis at REDIS_URL (default redis://localhost:6379)
    #[tokio::test]
    #[ignore]
    async fn test_redis_enqueue_complete_await() {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let prefix = format!("task_forge_test_{}", Uuid::new_v4());
        let queue = RedisJobQueue::connect(&url, &prefix).await.unwrap();

        let handle = queue
            .enqueue(queues::ENRICHMENT, job_names::ENRICH, json!({}), JobOptions::new())
            .await
            .unwrap();

        let mut conn = queue.blocking_connection().await.unwrap();
        let mut dequeued = queue
            .dequeue(&mut conn, queues::ENRICHMENT, Duration::from_secs(1))
            .await
            .unwrap()
            .expect("job should be available");
        assert_eq!(dequeued.job.id, handle.id);
        assert_eq!(queue.processing_len(queues::ENRICHMENT).await.unwrap(), 1);

        dequeued.job.increment_attempts();
        let result = JobResult::success(&dequeued.job, "worker-0", json!({"ok": true}), 1);
        queue.complete(&dequeued, &result).await.unwrap();

        let value = queue.await_result(&handle).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(queue.processing_len(queues::ENRICHMENT).await.unwrap(), 0);

        queue
            .update_progress(&handle, ProgressUpdate::pause())
            .await
            .unwrap();
        let progress = queue.progress(&handle).await.unwrap().unwrap();
        assert!(progress.paused);

        queue.clear(queues::ENRICHMENT).await.unwrap();
    }
}
