//! task-forge: task-processing pipeline orchestrator.
//!
//! This library drives a task through decomposition, enrichment and prompt
//! generation over an asynchronous job queue, with checkpoints, retry with
//! backoff and projection of pipeline state onto the task record.

// Core modules
pub mod cli;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod state_machine;
pub mod storage;
pub mod workers;

// Re-export commonly used types
pub use error::PipelineError;
pub use pipeline::{
    PipelineConfig, PipelineContext, PipelineEvent, PipelineOrchestrator, PipelineResult,
};
pub use state_machine::{PhaseState, PipelineState, StateMachine};
