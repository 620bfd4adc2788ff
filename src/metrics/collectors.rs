//! Recording helpers for task_forge operations.
//!
//! `MetricsCollector` wraps the raw Prometheus statics so call sites never
//! deal with labels or initialization order. Every method is a no-op until
//! `init_metrics()` has run.

use super::prometheus::{
    ACTIVE_PIPELINES, ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOB_ATTEMPTS_TOTAL, PHASE_DURATION,
    PIPELINES_TOTAL, PIPELINE_DURATION, QUEUE_DEPTH,
};

/// Metrics collector for recording operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a pipeline reaching a terminal state.
    ///
    /// # Arguments
    ///
    /// * `state` - Terminal state name (e.g. "COMPLETED", "FAILED")
    /// * `duration_secs` - Wall-clock duration of the run
    pub fn record_pipeline(&self, state: &str, duration_secs: f64) {
        if let Some(total) = PIPELINES_TOTAL.get() {
            total.with_label_values(&[state]).inc();
        }

        if let Some(duration) = PIPELINE_DURATION.get() {
            duration.observe(duration_secs);
        }

        tracing::trace!(
            state = state,
            duration_secs = duration_secs,
            "Recorded pipeline metric"
        );
    }

    /// Record one phase execution.
    pub fn record_phase(&self, phase: &str, success: bool, duration_secs: f64) {
        let status = if success { "success" } else { "failure" };

        if let Some(duration) = PHASE_DURATION.get() {
            duration
                .with_label_values(&[phase, status])
                .observe(duration_secs);
        }

        tracing::trace!(
            phase = phase,
            status = status,
            duration_secs = duration_secs,
            "Recorded phase metric"
        );
    }

    /// Record one job attempt outcome ("success", "retry", "failure").
    pub fn record_job_attempt(&self, queue: &str, status: &str) {
        if let Some(attempts) = JOB_ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[queue, status]).inc();
        }
    }

    pub fn set_active_pipelines(&self, count: usize) {
        if let Some(active) = ACTIVE_PIPELINES.get() {
            active.set(count as f64);
        }
    }

    /// Update the queue depth for a specific queue.
    pub fn update_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }

        tracing::trace!(
            queue_name = queue_name,
            depth = depth,
            "Updated queue depth metric"
        );
    }

    /// Update the count of active workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active workers metric");
    }

    /// Increment the count of jobs in progress by 1.
    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    /// Decrement the count of jobs in progress by 1.
    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
