//! Job definitions for the scheduler.
//!
//! This module defines the core job types used by every queue adapter:
//!
//! - `Job`: A unit of work to be executed by a handler
//! - `JobOptions` / `BackoffPolicy`: Per-job retry configuration
//! - `JobHandle`: What the producer keeps to await or signal a job
//! - `JobProgress` / `ProgressUpdate`: Progress channel payloads
//! - `JobResult`: Result record published when a job settles
//! - `JobHandler` / `JobError`: The consumer contract

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Default maximum number of attempts for a job.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default priority for jobs (0 is normal priority).
const DEFAULT_PRIORITY: i32 = 0;

/// Logical queue names.
pub mod queues {
    /// Top-level pipeline executions.
    pub const PIPELINE: &str = "pipeline";
    /// Decomposition phase jobs.
    pub const DECOMPOSITION: &str = "decomposition";
    /// Enrichment phase jobs.
    pub const ENRICHMENT: &str = "enrichment";
}

/// Job names used on the logical queues.
pub mod job_names {
    pub const EXECUTE: &str = "execute";
    pub const DECOMPOSE: &str = "decompose";
    pub const ENRICH: &str = "enrich";
}

/// Backoff curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

/// Delay policy applied between failed attempts of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Delay before the first retry, in milliseconds.
    pub delay: u64,
    /// Growth factor for exponential backoff.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default)]
    pub max_delay: Option<u64>,
}

fn default_multiplier() -> f64 {
    2.0
}

impl BackoffPolicy {
    /// Exponential backoff seeded at `delay_ms`.
    pub fn exponential(delay_ms: u64, multiplier: f64, max_delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay: delay_ms,
            multiplier,
            max_delay: Some(max_delay_ms),
        }
    }

    /// Constant delay between attempts.
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay: delay_ms,
            multiplier: 1.0,
            max_delay: None,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// Exponential: `delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let raw = match self.kind {
            BackoffKind::Fixed => self.delay as f64,
            BackoffKind::Exponential => {
                let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
                self.delay as f64 * self.multiplier.powi(exponent)
            }
        };

        let capped = match self.max_delay {
            Some(max) if !raw.is_finite() || raw > max as f64 => max as f64,
            _ if !raw.is_finite() => u64::MAX as f64,
            _ => raw,
        };

        Duration::from_millis(capped.max(0.0).round() as u64)
    }
}

/// Options a producer attaches to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Total number of attempts, including the first one.
    pub attempts: u32,
    #[serde(default)]
    pub backoff: Option<BackoffPolicy>,
    /// Per-attempt timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub priority: i32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: None,
            timeout_ms: None,
            priority: DEFAULT_PRIORITY,
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempt budget. Zero is treated as a single attempt.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// A job representing a unit of work to be executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: Uuid,
    /// Logical queue the job was submitted to.
    pub queue: String,
    /// Job name within the queue (e.g. `decompose`).
    pub name: String,
    /// Opaque payload handed to the handler.
    pub payload: Value,
    pub options: JobOptions,
    /// When this job was created.
    pub created_at: DateTime<Utc>,
    /// Number of attempts made so far.
    pub attempts: u32,
}

impl Job {
    /// Creates a new job with zero attempts made.
    pub fn new(
        queue: impl Into<String>,
        name: impl Into<String>,
        payload: Value,
        options: JobOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            name: name.into(),
            payload,
            options,
            created_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Increments the attempt counter.
    ///
    /// This should be called before each execution attempt.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Returns whether the job may be attempted again after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.options.attempts.max(1)
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.options.attempts.max(1).saturating_sub(self.attempts)
    }

    /// Delay to wait before the next attempt, given the attempts made so far.
    pub fn next_retry_delay(&self) -> Duration {
        self.options
            .backoff
            .as_ref()
            .map(|b| b.delay_for_attempt(self.attempts))
            .unwrap_or(Duration::ZERO)
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            queue: self.queue.clone(),
            name: self.name.clone(),
        }
    }

    /// Returns how long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub queue: String,
    pub name: String,
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.queue, self.name, self.id)
    }
}

/// Last known progress of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    /// Completion percentage, 0-100.
    pub percent: u8,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
}

/// A single write to a job's progress channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ProgressUpdate {
    Percent { value: u8 },
    Signal {
        paused: bool,
        #[serde(default)]
        checkpoint_id: Option<String>,
    },
}

impl ProgressUpdate {
    pub fn percent(value: u8) -> Self {
        ProgressUpdate::Percent { value }
    }

    pub fn pause() -> Self {
        ProgressUpdate::Signal {
            paused: true,
            checkpoint_id: None,
        }
    }

    pub fn resume(checkpoint_id: Option<String>) -> Self {
        ProgressUpdate::Signal {
            paused: false,
            checkpoint_id,
        }
    }
}

impl JobProgress {
    /// Merge an update. Percent writes keep the last pause signal.
    pub fn apply(&mut self, update: ProgressUpdate) {
        match update {
            ProgressUpdate::Percent { value } => self.percent = value.min(100),
            ProgressUpdate::Signal {
                paused,
                checkpoint_id,
            } => {
                self.paused = paused;
                self.checkpoint_id = checkpoint_id;
            }
        }
    }
}

/// Status of a settled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job completed successfully.
    Completed,
    /// Job failed after exhausting its attempts.
    Failed,
    /// The last attempt exceeded its timeout.
    Timeout,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Result of a job execution.
///
/// Published once per job, after the final attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// ID of the job that was executed.
    pub job_id: Uuid,
    /// Final status of the job.
    pub status: JobStatus,
    /// Handler output for completed jobs.
    #[serde(default)]
    pub output: Option<Value>,
    /// Error message if the job failed.
    pub error: Option<String>,
    /// Attempts made, including the final one.
    pub attempts: u32,
    /// When this job settled.
    pub completed_at: DateTime<Utc>,
    /// ID of the worker that processed the final attempt.
    pub worker_id: String,
    /// Duration of the final attempt in milliseconds.
    pub duration_ms: u64,
}

impl JobResult {
    /// Creates a new successful job result.
    pub fn success(
        job: &Job,
        worker_id: impl Into<String>,
        output: Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id: job.id,
            status: JobStatus::Completed,
            output: Some(output),
            error: None,
            attempts: job.attempts,
            completed_at: Utc::now(),
            worker_id: worker_id.into(),
            duration_ms,
        }
    }

    /// Creates a new failed job result.
    pub fn failure(
        job: &Job,
        worker_id: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            job_id: job.id,
            status: JobStatus::Failed,
            output: None,
            error: Some(error.into()),
            attempts: job.attempts,
            completed_at: Utc::now(),
            worker_id: worker_id.into(),
            duration_ms,
        }
    }

    /// Creates a new timeout job result.
    pub fn timeout(job: &Job, worker_id: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            job_id: job.id,
            status: JobStatus::Timeout,
            output: None,
            error: Some("Job execution timed out".to_string()),
            attempts: job.attempts,
            completed_at: Utc::now(),
            worker_id: worker_id.into(),
            duration_ms,
        }
    }

    /// Returns whether the job completed successfully.
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// Failure reported by a job handler for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct JobError {
    pub message: String,
    /// Whether the queue may spend another attempt on this job.
    pub retryable: bool,
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// An error that no further attempt can fix (e.g. a malformed payload).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::fatal(format!("Invalid job payload: {}", err))
    }
}

/// Consumer side of a queue: executes one attempt of a job.
///
/// Delivery is at-least-once, so implementations must be idempotent per job id.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Value, JobError>;
}
