//! Error types for pipeline operations.
//!
//! Subsystem errors (`QueueError`, `StoreError`, `ConfigError`,
//! `IllegalTransitionError`) live next to their modules and convert into
//! `PipelineError` at the orchestrator boundary.

use thiserror::Error;

use crate::pipeline::config::ConfigError;
use crate::pipeline::types::PhaseKind;
use crate::scheduler::QueueError;
use crate::state_machine::IllegalTransitionError;
use crate::storage::StoreError;

/// Errors surfaced by the pipeline orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Checkpoint '{checkpoint_id}' not found for pipeline {pipeline_id}")]
    CheckpointNotFound {
        pipeline_id: String,
        checkpoint_id: String,
    },

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransitionError),

    #[error("Phase {phase} failed: {message}")]
    PhaseExecution { phase: PhaseKind, message: String },

    #[error("Task status projection failed: {0}")]
    Projection(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Prompt rendering failed: {0}")]
    Render(#[from] tera::Error),
}

impl PipelineError {
    /// Unknown task, pipeline or checkpoint.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PipelineError::TaskNotFound(_)
                | PipelineError::PipelineNotFound(_)
                | PipelineError::CheckpointNotFound { .. }
        )
    }

    /// Message recorded as a failed run's `error`.
    ///
    /// Wrapper prefixes are dropped so the caller sees what actually broke.
    pub fn root_message(&self) -> String {
        match self {
            PipelineError::PhaseExecution { message, .. } => message.clone(),
            PipelineError::Queue(e) => e.to_string(),
            PipelineError::Store(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}
