//! Job queue infrastructure for distributing phase work.
//!
//! - **JobQueue**: Producer contract (`enqueue`, `await_result`, progress)
//! - **InMemoryJobQueue**: tokio-task adapter for tests and single-process use
//! - **RedisJobQueue**: Redis adapter with reliable dequeue using BRPOPLPUSH
//! - **WorkerPool**: Pool of workers consuming Redis queues
//! - **Job**: Job definitions with retry/backoff and dead letter support
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │ Orchestrator │
//!                      │  (producer)  │
//!                      └──────┬───────┘
//!                             │ enqueue / await_result
//!                      ┌──────▼───────┐
//!                      │    Redis     │
//!                      │    Queues    │
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌──────────┐       ┌─────────────┐      ┌────────────┐
//!    │ pipeline │       │decomposition│      │ enrichment │
//!    │ workers  │       │   workers   │      │  workers   │
//!    └──────────┘       └─────────────┘      └────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use task_forge::scheduler::{queues, InMemoryJobQueue, JobOptions, JobQueue};
//!
//! let queue = InMemoryJobQueue::new();
//! queue.register_handler(queues::DECOMPOSITION, handler).await;
//!
//! let handle = queue
//!     .enqueue(queues::DECOMPOSITION, "decompose", payload, JobOptions::new())
//!     .await?;
//! let output = queue.await_result(&handle).await?;
//! ```
//!
//! # Reliability Features
//!
//! - **At-least-once delivery**: handlers must be idempotent per job id
//! - **Crash recovery**: jobs in processing lists are requeued on pool start
//! - **Dead letter queue**: jobs that exhaust attempts are kept for analysis
//! - **Graceful shutdown**: workers finish current jobs before stopping

pub mod job;
pub mod memory;
pub mod queue;
pub mod redis_queue;
pub mod worker_pool;

pub use job::{
    job_names, queues, BackoffKind, BackoffPolicy, Job, JobError, JobHandle, JobHandler,
    JobOptions, JobProgress, JobResult, JobStatus, ProgressUpdate,
};
pub use memory::{InMemoryJobQueue, DEFAULT_SETTLED_RETENTION};
pub use queue::{JobQueue, QueueError, QueueStats};
pub use redis_queue::{DequeuedJob, RedisJobQueue, DEFAULT_KEY_PREFIX};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
