//! Job handlers for the three pipeline queues.
//!
//! Decomposition and enrichment logic is supplied through the [`Decomposer`]
//! and [`Enricher`] traits. The handlers here decode the wire payload, call
//! that logic, persist the subtasks and encode the wire result.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::pipeline::{
    DecomposeOutput, DecomposePayload, EnrichOutput, EnrichPayload, ExecutePayload,
    PhaseMetadata, PipelineContext, PipelineOrchestrator, SubtaskData,
};
use crate::scheduler::{Job, JobError, JobHandler};
use crate::storage::{StoreError, SubtaskStore};

/// Splits a task into subtasks.
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(
        &self,
        task_description: &str,
        context: &PipelineContext,
    ) -> Result<Vec<SubtaskData>, JobError>;
}

/// Refines decomposed subtasks.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(
        &self,
        subtasks: Vec<SubtaskData>,
        context: &PipelineContext,
    ) -> Result<Vec<SubtaskData>, JobError>;
}

/// Produces a single `general` subtask covering the whole description.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleSubtaskDecomposer;

#[async_trait]
impl Decomposer for SingleSubtaskDecomposer {
    async fn decompose(
        &self,
        task_description: &str,
        context: &PipelineContext,
    ) -> Result<Vec<SubtaskData>, JobError> {
        let title = task_description
            .lines()
            .next()
            .filter(|line| !line.trim().is_empty())
            .unwrap_or(&context.task_id)
            .trim()
            .to_string();

        Ok(vec![SubtaskData::new("general", title, task_description)
            .with_requirements(context.coding_standards.clone())])
    }
}

/// Returns subtasks unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityEnricher;

#[async_trait]
impl Enricher for IdentityEnricher {
    async fn enrich(
        &self,
        subtasks: Vec<SubtaskData>,
        _context: &PipelineContext,
    ) -> Result<Vec<SubtaskData>, JobError> {
        Ok(subtasks)
    }
}

fn store_error(e: StoreError) -> JobError {
    match e {
        StoreError::NotFound(_) | StoreError::InvalidData(_) => {
            JobError::fatal(format!("Failed to persist subtasks: {}", e))
        }
        other => JobError::retryable(format!("Failed to persist subtasks: {}", other)),
    }
}

/// Handles `decompose` jobs.
pub struct DecompositionHandler {
    decomposer: Arc<dyn Decomposer>,
    subtasks: Arc<dyn SubtaskStore>,
}

impl DecompositionHandler {
    pub fn new(decomposer: Arc<dyn Decomposer>, subtasks: Arc<dyn SubtaskStore>) -> Self {
        Self {
            decomposer,
            subtasks,
        }
    }
}

#[async_trait]
impl JobHandler for DecompositionHandler {
    async fn handle(&self, job: &Job) -> Result<Value, JobError> {
        let payload: DecomposePayload = serde_json::from_value(job.payload.clone())?;
        debug!(
            job_id = %job.id,
            pipeline_id = %payload.pipeline_id,
            task_id = %payload.task_id,
            attempt = job.attempts,
            "Decomposing task"
        );

        let subtasks = self
            .decomposer
            .decompose(&payload.task_description, &payload.context)
            .await?;

        // Replaces whatever an earlier delivery of this job wrote
        self.subtasks
            .create_subtasks(&payload.task_id, &subtasks)
            .await
            .map_err(store_error)?;

        info!(
            pipeline_id = %payload.pipeline_id,
            task_id = %payload.task_id,
            subtasks = subtasks.len(),
            "Task decomposed"
        );

        let output = DecomposeOutput {
            metadata: PhaseMetadata::new(&payload.task_id, &payload.pipeline_id, subtasks.len()),
            subtasks,
        };
        Ok(serde_json::to_value(output)?)
    }
}

/// Handles `enrich` jobs.
pub struct EnrichmentHandler {
    enricher: Arc<dyn Enricher>,
    subtasks: Arc<dyn SubtaskStore>,
}

impl EnrichmentHandler {
    pub fn new(enricher: Arc<dyn Enricher>, subtasks: Arc<dyn SubtaskStore>) -> Self {
        Self { enricher, subtasks }
    }
}

#[async_trait]
impl JobHandler for EnrichmentHandler {
    async fn handle(&self, job: &Job) -> Result<Value, JobError> {
        let payload: EnrichPayload = serde_json::from_value(job.payload.clone())?;
        debug!(
            job_id = %job.id,
            pipeline_id = %payload.pipeline_id,
            task_id = %payload.task_id,
            attempt = job.attempts,
            "Enriching subtasks"
        );

        let enriched = self
            .enricher
            .enrich(payload.subtasks, &payload.context)
            .await?;

        self.subtasks
            .update_subtasks(&payload.task_id, &enriched)
            .await
            .map_err(store_error)?;

        info!(
            pipeline_id = %payload.pipeline_id,
            task_id = %payload.task_id,
            subtasks = enriched.len(),
            "Subtasks enriched"
        );

        let output = EnrichOutput {
            metadata: PhaseMetadata::new(&payload.task_id, &payload.pipeline_id, enriched.len()),
            enriched_subtasks: enriched,
        };
        Ok(serde_json::to_value(output)?)
    }
}

/// Handles `execute` jobs by running the pipeline control loop.
///
/// A failed run is still a successful job: the failure is carried in the
/// returned `PipelineResult`.
pub struct PipelineJobHandler {
    orchestrator: Arc<PipelineOrchestrator>,
}

impl PipelineJobHandler {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobHandler for PipelineJobHandler {
    async fn handle(&self, job: &Job) -> Result<Value, JobError> {
        let payload: ExecutePayload = serde_json::from_value(job.payload.clone())?;
        let result = self.orchestrator.execute_job(job.handle(), payload).await;
        Ok(serde_json::to_value(result)?)
    }
}
