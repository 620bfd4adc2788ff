//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by task_forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all task_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of pipelines reaching a terminal state, labeled by state.
pub static PIPELINES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// End-to-end pipeline duration in seconds.
pub static PIPELINE_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Phase execution duration in seconds, labeled by phase and status.
pub static PHASE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of pipelines currently held in the registry.
pub static ACTIVE_PIPELINES: OnceLock<Gauge> = OnceLock::new();

/// Number of jobs currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Total job attempts, labeled by queue and outcome.
pub static JOB_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of jobs in queue, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Repeated
/// calls are harmless: the first registered set stays in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Pipeline metrics
    let pipelines_total = CounterVec::new(
        Opts::new(
            "task_forge_pipelines_total",
            "Total number of pipelines reaching a terminal state",
        ),
        &["state"],
    )?;

    let pipeline_duration = Histogram::with_opts(
        HistogramOpts::new(
            "task_forge_pipeline_duration_seconds",
            "Pipeline execution duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]),
    )?;

    let phase_duration = HistogramVec::new(
        HistogramOpts::new(
            "task_forge_phase_duration_seconds",
            "Phase execution duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["phase", "status"],
    )?;

    let active_pipelines = Gauge::new(
        "task_forge_active_pipelines",
        "Number of pipelines currently registered",
    )?;

    // Queue metrics
    let jobs_in_progress = Gauge::new(
        "task_forge_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    let job_attempts_total = CounterVec::new(
        Opts::new("task_forge_job_attempts_total", "Total job attempts"),
        &["queue", "status"],
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("task_forge_queue_depth", "Number of jobs in queue"),
        &["queue_name"],
    )?;

    // Worker metrics
    let active_workers = Gauge::new("task_forge_active_workers", "Number of active workers")?;

    registry.register(Box::new(pipelines_total.clone()))?;
    registry.register(Box::new(pipeline_duration.clone()))?;
    registry.register(Box::new(phase_duration.clone()))?;
    registry.register(Box::new(active_pipelines.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(job_attempts_total.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = PIPELINES_TOTAL.set(pipelines_total);
    let _ = PIPELINE_DURATION.set(pipeline_duration);
    let _ = PHASE_DURATION.set(phase_duration);
    let _ = ACTIVE_PIPELINES.set(active_pipelines);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = JOB_ATTEMPTS_TOTAL.set(job_attempts_total);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// text is a single comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
