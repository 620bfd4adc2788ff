//! Active pipeline runs owned by one orchestrator.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::checkpoint::{CheckpointLog, PipelineCheckpoint};
use super::config::PipelineConfig;
use crate::error::PipelineError;
use crate::scheduler::JobHandle;
use crate::state_machine::{PipelineState, StateMachine};

/// Mutable record of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub pipeline_id: String,
    pub task_id: String,
    pub state: PipelineState,
    pub checkpoints: CheckpointLog,
    /// Handle of the top-level `execute` job, once enqueued.
    pub execute_job: Option<JobHandle>,
    pub started_at: DateTime<Utc>,
    pub config: PipelineConfig,
}

impl PipelineRun {
    pub fn new(
        pipeline_id: impl Into<String>,
        task_id: impl Into<String>,
        state: PipelineState,
        config: PipelineConfig,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            task_id: task_id.into(),
            state,
            checkpoints: CheckpointLog::new(),
            execute_job: None,
            started_at: Utc::now(),
            config,
        }
    }
}

/// Keyed store of active runs.
///
/// Every method holds the lock for a single map operation; entries of
/// different pipelines never interact.
#[derive(Debug, Default)]
pub struct PipelineRegistry {
    runs: RwLock<HashMap<String, PipelineRun>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `run`, replacing any previous run with the same id.
    pub async fn register(&self, run: PipelineRun) {
        self.runs
            .write()
            .await
            .insert(run.pipeline_id.clone(), run);
    }

    /// Registers a run in `INITIALIZING` unless one already exists.
    ///
    /// Returns `true` if a new run was inserted.
    pub async fn adopt(&self, pipeline_id: &str, task_id: &str, config: &PipelineConfig) -> bool {
        let mut runs = self.runs.write().await;
        if runs.contains_key(pipeline_id) {
            return false;
        }
        runs.insert(
            pipeline_id.to_string(),
            PipelineRun::new(
                pipeline_id,
                task_id,
                PipelineState::Initializing,
                config.clone(),
            ),
        );
        true
    }

    /// Snapshot of a run.
    pub async fn get(&self, pipeline_id: &str) -> Option<PipelineRun> {
        self.runs.read().await.get(pipeline_id).cloned()
    }

    pub async fn contains(&self, pipeline_id: &str) -> bool {
        self.runs.read().await.contains_key(pipeline_id)
    }

    pub async fn state(&self, pipeline_id: &str) -> Option<PipelineState> {
        self.runs.read().await.get(pipeline_id).map(|r| r.state)
    }

    /// Overwrites the state without validation. Used by rollback.
    pub async fn set_state(
        &self,
        pipeline_id: &str,
        state: PipelineState,
    ) -> Result<PipelineState, PipelineError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(pipeline_id)
            .ok_or_else(|| PipelineError::PipelineNotFound(pipeline_id.to_string()))?;
        Ok(std::mem::replace(&mut run.state, state))
    }

    /// Validates and applies `current -> to` under one write lock.
    ///
    /// Returns the previous state.
    pub async fn transition(
        &self,
        pipeline_id: &str,
        to: PipelineState,
        machine: &StateMachine,
    ) -> Result<PipelineState, PipelineError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(pipeline_id)
            .ok_or_else(|| PipelineError::PipelineNotFound(pipeline_id.to_string()))?;

        let from = run.state;
        run.state = machine.transition_pipeline(from, to, pipeline_id)?;
        Ok(from)
    }

    /// Appends a checkpoint capturing the run's current state.
    pub async fn append_checkpoint(
        &self,
        pipeline_id: &str,
        current_phase: u32,
        data: Map<String, Value>,
    ) -> Result<PipelineCheckpoint, PipelineError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(pipeline_id)
            .ok_or_else(|| PipelineError::PipelineNotFound(pipeline_id.to_string()))?;

        let state = run.state;
        Ok(run
            .checkpoints
            .append(pipeline_id, state, current_phase, data))
    }

    pub async fn find_checkpoint(
        &self,
        pipeline_id: &str,
        checkpoint_id: &str,
    ) -> Result<PipelineCheckpoint, PipelineError> {
        let runs = self.runs.read().await;
        let run = runs
            .get(pipeline_id)
            .ok_or_else(|| PipelineError::PipelineNotFound(pipeline_id.to_string()))?;

        run.checkpoints
            .find(checkpoint_id)
            .cloned()
            .ok_or_else(|| PipelineError::CheckpointNotFound {
                pipeline_id: pipeline_id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
            })
    }

    /// Checkpoints of a run in creation order; empty for unknown ids.
    pub async fn checkpoints(&self, pipeline_id: &str) -> Vec<PipelineCheckpoint> {
        self.runs
            .read()
            .await
            .get(pipeline_id)
            .map(|r| r.checkpoints.entries().to_vec())
            .unwrap_or_default()
    }

    pub async fn set_execute_job(
        &self,
        pipeline_id: &str,
        handle: JobHandle,
    ) -> Result<(), PipelineError> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(pipeline_id)
            .ok_or_else(|| PipelineError::PipelineNotFound(pipeline_id.to_string()))?;
        run.execute_job = Some(handle);
        Ok(())
    }

    pub async fn execute_job(&self, pipeline_id: &str) -> Option<JobHandle> {
        self.runs
            .read()
            .await
            .get(pipeline_id)
            .and_then(|r| r.execute_job.clone())
    }

    /// Removes a run, returning it if present.
    pub async fn evict(&self, pipeline_id: &str) -> Option<PipelineRun> {
        self.runs.write().await.remove(pipeline_id)
    }

    pub async fn ids(&self) -> Vec<String> {
        self.runs.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}
