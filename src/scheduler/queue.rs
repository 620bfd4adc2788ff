//! Producer-side queue contract shared by every broker adapter.
//!
//! A queue accepts jobs under a logical queue name, runs them through the
//! handler registered for that name with the job's own retry policy, and
//! lets the producer wait for the settled result without polling.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::job::{JobHandle, JobOptions, JobProgress, ProgressUpdate};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the broker.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Job not known to this queue.
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    /// No handler is registered for the queue name.
    #[error("No handler registered for queue '{0}'")]
    NoHandler(String),

    /// The job exhausted its attempts (or failed with a non-retryable error).
    #[error("{message}")]
    JobFailed {
        job_id: Uuid,
        attempts: u32,
        message: String,
    },

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The queue was shut down while the caller was waiting.
    #[error("Queue closed")]
    Closed,
}

impl QueueError {
    /// Whether this error reports a job that ran and failed, as opposed to a
    /// broker or dispatch problem.
    pub fn is_job_failure(&self) -> bool {
        matches!(self, QueueError::JobFailed { .. })
    }
}

/// Asynchronous at-least-once job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submits a job to `queue` and returns immediately.
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        options: JobOptions,
    ) -> Result<JobHandle, QueueError>;

    /// Waits until the job settles.
    ///
    /// Returns the handler output, or `QueueError::JobFailed` carrying the
    /// last error once no attempts remain.
    async fn await_result(&self, handle: &JobHandle) -> Result<Value, QueueError>;

    /// Merges an update into the job's progress.
    async fn update_progress(
        &self,
        handle: &JobHandle,
        update: ProgressUpdate,
    ) -> Result<(), QueueError>;

    /// Last known progress, if any was ever reported.
    async fn progress(&self, handle: &JobHandle) -> Result<Option<JobProgress>, QueueError>;

    /// Attempts made so far, `None` while the broker has no record of any.
    async fn attempts(&self, handle: &JobHandle) -> Result<Option<u32>, QueueError>;
}

/// Statistics about queue state.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Number of jobs waiting to be processed.
    pub pending_jobs: usize,
    /// Number of jobs currently being processed.
    pub processing_jobs: usize,
    /// Number of jobs in the dead letter queue.
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    /// Returns the total number of jobs in all queues.
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.processing_jobs + self.dead_letter_jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = QueueError::JobNotFound(Uuid::new_v4());
        assert!(err.to_string().contains("not found"));

        let err = QueueError::NoHandler("enrichment".to_string());
        assert!(err.to_string().contains("enrichment"));

        let err = QueueError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn test_job_failed_displays_root_message() {
        let err = QueueError::JobFailed {
            job_id: Uuid::new_v4(),
            attempts: 3,
            message: "decomposer unavailable".to_string(),
        };

        assert_eq!(err.to_string(), "decomposer unavailable");
        assert!(err.is_job_failure());
        assert!(!QueueError::Closed.is_job_failure());
    }

    #[test]
    fn test_queue_stats() {
        let stats = QueueStats {
            queue_name: "decomposition".to_string(),
            pending_jobs: 10,
            processing_jobs: 5,
            dead_letter_jobs: 2,
        };

        assert_eq!(stats.total_jobs(), 17);
    }
}
