//! CLI command definitions for task-forge.
//!
//! This module provides the command-line interface for running pipeline
//! workers, starting pipelines and inspecting queues.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::metrics::init_metrics;
use crate::pipeline::{PipelineConfig, PipelineContext, PipelineOrchestrator};
use crate::scheduler::{
    queues, QueueStats, RedisJobQueue, WorkerPool, WorkerPoolConfig, DEFAULT_KEY_PREFIX,
};
use crate::storage::Database;
use crate::workers::{
    DecompositionHandler, EnrichmentHandler, IdentityEnricher, PipelineJobHandler,
    SingleSubtaskDecomposer,
};

/// Default Redis connection string.
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default PostgreSQL connection string.
const DEFAULT_DATABASE_URL: &str = "postgres://localhost/task_forge";

/// Task-processing pipeline orchestrator.
#[derive(Parser)]
#[command(name = "task-forge")]
#[command(about = "Drive tasks through decomposition, enrichment and prompt generation")]
#[command(version)]
#[command(
    long_about = "task-forge runs the task-processing pipeline over a Redis job queue.\n\nExample usage:\n  task-forge worker --workers 8\n  task-forge start --task-id task-42 --tech-stack rust,postgres\n  task-forge queue-stats --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run pipeline workers until interrupted.
    Worker(WorkerArgs),

    /// Start a pipeline for an existing task.
    Start(StartArgs),

    /// Show queue statistics.
    #[command(name = "queue-stats", alias = "stats")]
    QueueStats(QueueStatsArgs),
}

/// Connection settings shared by every subcommand.
#[derive(Parser, Debug, Clone)]
pub struct ConnectionArgs {
    /// Redis connection string.
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Prefix for every Redis key.
    #[arg(long, env = "TASK_FORGE_KEY_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    pub key_prefix: String,
}

/// Arguments for `task-forge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// PostgreSQL connection string.
    #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    pub database_url: String,

    /// Number of workers per queue.
    #[arg(short = 'w', long, default_value = "4")]
    pub workers: usize,

    /// Pipeline configuration file (YAML). Falls back to PIPELINE_* variables.
    #[arg(short = 'c', long)]
    pub config: Option<String>,

    /// Seconds to wait for in-flight jobs on shutdown.
    #[arg(long, default_value = "30")]
    pub shutdown_timeout: u64,
}

/// Arguments for `task-forge start`.
#[derive(Parser, Debug)]
pub struct StartArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// PostgreSQL connection string.
    #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    pub database_url: String,

    /// Id of the task to process.
    #[arg(short = 't', long)]
    pub task_id: String,

    /// Comma-separated technologies (e.g. rust,postgres).
    #[arg(long, value_delimiter = ',')]
    pub tech_stack: Vec<String>,

    /// Comma-separated coding standards.
    #[arg(long, value_delimiter = ',')]
    pub coding_standards: Vec<String>,

    /// Pipeline configuration file (YAML). Falls back to PIPELINE_* variables.
    #[arg(short = 'c', long)]
    pub config: Option<String>,
}

/// Arguments for `task-forge queue-stats`.
#[derive(Parser, Debug)]
pub struct QueueStatsArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    /// Queue to inspect. Repeat for several; defaults to all pipeline queues.
    #[arg(short = 'q', long = "queue")]
    pub queues: Vec<String>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments without running any command.
///
/// Lets the caller initialize logging from `log_level` before running.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Start(args) => run_start_command(args).await,
        Commands::QueueStats(args) => run_queue_stats_command(args).await,
    }
}

fn load_pipeline_config(path: Option<&str>) -> anyhow::Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load pipeline config from {}", path))?,
        None => PipelineConfig::from_env().context("Invalid PIPELINE_* environment")?,
    };
    Ok(config)
}

async fn connect_queue(connection: &ConnectionArgs) -> anyhow::Result<Arc<RedisJobQueue>> {
    let queue = RedisJobQueue::connect(&connection.redis_url, &connection.key_prefix)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", connection.redis_url))?;
    Ok(Arc::new(queue))
}

async fn connect_database(database_url: &str) -> anyhow::Result<Arc<Database>> {
    let database = Database::connect(database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    database
        .run_migrations()
        .await
        .context("Failed to run database migrations")?;
    Ok(Arc::new(database))
}

// ============================================================================
// Worker
// ============================================================================

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registration failed, continuing without metrics");
    }

    let pipeline_config = load_pipeline_config(args.config.as_deref())?;
    let queue = connect_queue(&args.connection).await?;
    let database = connect_database(&args.database_url).await?;

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        queue.clone(),
        database.clone(),
        pipeline_config,
    )?);

    let pool_config = WorkerPoolConfig::new(args.workers)
        .with_redis_url(args.connection.redis_url.clone())
        .with_key_prefix(args.connection.key_prefix.clone())
        .with_shutdown_timeout(Duration::from_secs(args.shutdown_timeout));

    let mut pool = WorkerPool::with_queue(pool_config, queue);
    pool.register_handler(
        queues::PIPELINE,
        Arc::new(PipelineJobHandler::new(orchestrator)),
    );
    pool.register_handler(
        queues::DECOMPOSITION,
        Arc::new(DecompositionHandler::new(
            Arc::new(SingleSubtaskDecomposer),
            database.clone(),
        )),
    );
    pool.register_handler(
        queues::ENRICHMENT,
        Arc::new(EnrichmentHandler::new(Arc::new(IdentityEnricher), database)),
    );

    pool.start().await?;
    info!(
        workers = args.workers,
        queues = ?pool.queues(),
        "Worker pool running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        processed = stats.total_processed(),
        succeeded = stats.jobs_completed,
        failed = stats.jobs_failed,
        retried = stats.jobs_retried,
        "Worker pool stopped"
    );
    Ok(())
}

// ============================================================================
// Start
// ============================================================================

async fn run_start_command(args: StartArgs) -> anyhow::Result<()> {
    let pipeline_config = load_pipeline_config(args.config.as_deref())?;
    let queue = connect_queue(&args.connection).await?;
    let database = connect_database(&args.database_url).await?;

    let orchestrator = PipelineOrchestrator::new(queue, database, pipeline_config)?;
    let context = PipelineContext::new(&args.task_id)
        .with_tech_stack(args.tech_stack)
        .with_coding_standards(args.coding_standards);

    let pipeline_id = orchestrator.start_pipeline(context, None).await?;

    info!(pipeline_id = %pipeline_id, task_id = %args.task_id, "Pipeline enqueued");
    println!("{}", pipeline_id);
    Ok(())
}

// ============================================================================
// Queue statistics
// ============================================================================

#[derive(Debug, Serialize)]
struct QueueStatsOutput {
    queues: Vec<QueueStats>,
    total_jobs: usize,
}

fn default_queue_names() -> Vec<String> {
    [queues::PIPELINE, queues::DECOMPOSITION, queues::ENRICHMENT]
        .iter()
        .map(|q| q.to_string())
        .collect()
}

async fn run_queue_stats_command(args: QueueStatsArgs) -> anyhow::Result<()> {
    let queue = connect_queue(&args.connection).await?;
    let names = if args.queues.is_empty() {
        default_queue_names()
    } else {
        args.queues
    };

    let mut stats = Vec::with_capacity(names.len());
    for name in &names {
        stats.push(queue.stats(name).await?);
    }
    let output = QueueStatsOutput {
        total_jobs: stats.iter().map(QueueStats::total_jobs).sum(),
        queues: stats,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("\n=== Queue Statistics ===");
    println!(
        "{:<16} {:>10} {:>12} {:>12}",
        "Queue", "Pending", "Processing", "Dead letter"
    );
    for s in &output.queues {
        println!(
            "{:<16} {:>10} {:>12} {:>12}",
            s.queue_name, s.pending_jobs, s.processing_jobs, s.dead_letter_jobs
        );
    }
    println!("Total jobs: {}", output.total_jobs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_start_command() {
        let cli = Cli::try_parse_from([
            "task-forge",
            "start",
            "--task-id",
            "task-42",
            "--tech-stack",
            "rust,postgres",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Start(args) => {
                assert_eq!(args.task_id, "task-42");
                assert_eq!(args.tech_stack, ["rust", "postgres"]);
                assert!(args.coding_standards.is_empty());
                assert!(args.config.is_none());
            }
            _ => panic!("expected start command"),
        }
    }

    #[test]
    fn test_parse_worker_with_global_log_level() {
        let cli = Cli::try_parse_from([
            "task-forge",
            "worker",
            "--workers",
            "8",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.workers, 8);
                assert_eq!(args.shutdown_timeout, 30);
            }
            _ => panic!("expected worker command"),
        }
    }

    #[test]
    fn test_parse_queue_stats() {
        let cli = Cli::try_parse_from([
            "task-forge",
            "queue-stats",
            "-q",
            "decomposition",
            "--json",
        ])
        .unwrap();

        match cli.command {
            Commands::QueueStats(args) => {
                assert_eq!(args.queues, ["decomposition"]);
                assert!(args.json);
            }
            _ => panic!("expected queue-stats command"),
        }
    }

    #[test]
    fn test_default_queue_names() {
        assert_eq!(
            default_queue_names(),
            ["pipeline", "decomposition", "enrichment"]
        );
    }

    #[test]
    fn test_load_pipeline_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, "timeoutMs: 5000\n").unwrap();

        let config = load_pipeline_config(path.to_str()).unwrap();
        assert_eq!(config.timeout_ms, 5000);

        assert!(load_pipeline_config(Some("/nonexistent/pipeline.yaml")).is_err());
    }
}
