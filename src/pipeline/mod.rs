//! Pipeline orchestration for task processing.
//!
//! This module drives a single task through its phases and keeps the
//! bookkeeping each run needs.
//!
//! # Architecture
//!
//! - **Orchestrator**: the control loop, invoked from the `execute` job handler
//! - **Registry**: active runs keyed by pipeline id
//! - **Checkpoint**: append-only per-run snapshot log
//! - **Projection**: best-effort mapping of pipeline state onto task status
//! - **Prompts**: tera rendering for the prompt-generation phase
//! - **Config**: retry strategy, checkpoints, timeouts and audit settings
//!
//! # Pipeline Flow
//!
//! 1. **Start**: the task is looked up, a run is registered and moved to `INITIALIZING`
//! 2. **Decomposition**: a `decompose` job splits the task into subtasks
//! 3. **Enrichment**: an `enrich` job refines those subtasks
//! 4. **Prompt Generation**: one prompt document is rendered per category
//! 5. **Completion**: the run ends in `COMPLETED` or `FAILED` and is evicted
//!
//! Every transition is projected onto the task record, and a checkpoint is
//! taken after each successful phase when checkpoints are enabled.

pub mod checkpoint;
pub mod config;
pub mod events;
pub mod orchestrator;
pub mod projection;
pub mod prompts;
pub mod registry;
pub mod types;

pub use checkpoint::{CheckpointLog, PipelineCheckpoint};
pub use config::{
    ConfigError, PipelineConfig, PipelineConfigOverrides, RetryStrategy, RetryStrategyOverrides,
};
pub use events::PipelineEvent;
pub use orchestrator::PipelineOrchestrator;
pub use projection::{task_status_for, TaskStatusProjector};
pub use prompts::PromptRenderer;
pub use registry::{PipelineRegistry, PipelineRun};
pub use types::{
    DecomposeOutput, DecomposePayload, EnrichOutput, EnrichPayload, ExecutePayload,
    GeneratedPrompt, PhaseKind, PhaseMetadata, PhaseResult, PipelineContext, PipelineResult,
    SubtaskData,
};
