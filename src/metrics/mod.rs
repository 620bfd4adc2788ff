//! Metrics module for Prometheus-based monitoring.
//!
//! Covers pipeline outcomes and durations, phase durations, job attempts and
//! worker/queue gauges.
//!
//! # Example
//!
//! ```ignore
//! use task_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//!
//! let collector = MetricsCollector::new();
//! collector.record_phase("decomposition", true, 1.5);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_PIPELINES, ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOB_ATTEMPTS_TOTAL, PHASE_DURATION,
    PIPELINES_TOTAL, PIPELINE_DURATION, QUEUE_DEPTH, REGISTRY,
};
