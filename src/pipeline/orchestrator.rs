//! Pipeline orchestrator driving a task through its phases.
//!
//! This module provides the `PipelineOrchestrator` that coordinates:
//! - Run registration and state transitions
//! - Phase dispatch over the job queue (decomposition, enrichment)
//! - In-process prompt generation
//! - Checkpointing and logical rollback
//! - Task status projection
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use task_forge::pipeline::{PipelineConfig, PipelineContext, PipelineOrchestrator};
//!
//! let orchestrator = Arc::new(PipelineOrchestrator::new(queue, tasks, PipelineConfig::default())?);
//! let pipeline_id = orchestrator
//!     .start_pipeline(PipelineContext::new("task-1"), None)
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::checkpoint::PipelineCheckpoint;
use super::config::{PipelineConfig, PipelineConfigOverrides};
use super::events::PipelineEvent;
use super::projection::TaskStatusProjector;
use super::prompts::PromptRenderer;
use super::registry::{PipelineRegistry, PipelineRun};
use super::types::{
    DecomposeOutput, DecomposePayload, EnrichOutput, EnrichPayload, ExecutePayload,
    GeneratedPrompt, PhaseKind, PhaseResult, PipelineContext, PipelineResult, SubtaskData,
};
use crate::error::PipelineError;
use crate::metrics::MetricsCollector;
use crate::scheduler::{
    job_names, queues, JobHandle, JobOptions, JobQueue, ProgressUpdate, QueueError,
};
use crate::state_machine::{IllegalTransitionError, PhaseState, PipelineState, StateMachine};
use crate::storage::{Task, TaskStore};

/// Capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Target for audit log records.
const AUDIT_TARGET: &str = "audit";

/// Coordinates pipeline runs for any number of tasks concurrently.
pub struct PipelineOrchestrator {
    queue: Arc<dyn JobQueue>,
    tasks: Arc<dyn TaskStore>,
    default_config: PipelineConfig,
    registry: PipelineRegistry,
    machine: StateMachine,
    projector: TaskStatusProjector,
    prompts: PromptRenderer,
    events: broadcast::Sender<PipelineEvent>,
    metrics: MetricsCollector,
}

impl PipelineOrchestrator {
    /// Creates a new orchestrator.
    ///
    /// # Arguments
    ///
    /// * `queue` - Broker used for the `execute`, `decompose` and `enrich` jobs
    /// * `tasks` - Task record store, read for descriptions and written by projection
    /// * `default_config` - Process-wide configuration that per-run overrides merge over
    ///
    /// # Errors
    ///
    /// Returns `PipelineError` if the default configuration is invalid.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        tasks: Arc<dyn TaskStore>,
        default_config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        default_config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            queue,
            projector: TaskStatusProjector::new(tasks.clone()),
            tasks,
            default_config,
            registry: PipelineRegistry::new(),
            machine: StateMachine::new(),
            prompts: PromptRenderer::new()?,
            events,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn default_config(&self) -> &PipelineConfig {
        &self.default_config
    }

    /// Subscribes to lifecycle events of every run.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Ids of runs currently held by this orchestrator.
    pub async fn active_pipelines(&self) -> Vec<String> {
        self.registry.ids().await
    }

    /// Starts a pipeline for an existing task and returns its id.
    ///
    /// The run is registered, moved to `INITIALIZING` and handed to the
    /// `pipeline` queue; the phases execute in whichever worker consumes the
    /// `execute` job.
    pub async fn start_pipeline(
        &self,
        context: PipelineContext,
        overrides: Option<PipelineConfigOverrides>,
    ) -> Result<String, PipelineError> {
        let task = self.load_task(&context.task_id).await?;

        let config = match overrides {
            Some(overrides) => self.default_config.merged(&overrides),
            None => self.default_config.clone(),
        };
        config.validate()?;

        let pipeline_id = Uuid::new_v4().to_string();
        self.registry
            .register(PipelineRun::new(
                &pipeline_id,
                &task.id,
                PipelineState::Idle,
                config.clone(),
            ))
            .await;
        self.refresh_active_gauge().await;

        info!(pipeline_id = %pipeline_id, task_id = %task.id, "Starting pipeline");

        if let Err(e) = self
            .transition(&pipeline_id, &task.id, PipelineState::Initializing, &config)
            .await
        {
            error!(pipeline_id = %pipeline_id, error = %e, "Failed to initialize pipeline");
            self.evict(&pipeline_id).await;
            return Err(e);
        }

        if config.enable_checkpoints {
            self.checkpoint(&pipeline_id, 0, Map::new(), &config).await?;
        }

        let payload = serde_json::to_value(ExecutePayload {
            pipeline_id: pipeline_id.clone(),
            context,
            config: config.clone(),
        })?;

        // The whole run is never retried; phase jobs carry their own policy
        let handle = match self
            .queue
            .enqueue(
                queues::PIPELINE,
                job_names::EXECUTE,
                payload,
                JobOptions::new().with_attempts(1),
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                error!(pipeline_id = %pipeline_id, error = %e, "Failed to enqueue pipeline job");
                self.abandon(&pipeline_id, &task.id, &config).await;
                return Err(e.into());
            }
        };

        debug!(pipeline_id = %pipeline_id, job_id = %handle.id, "Pipeline job enqueued");

        // The run may already have finished and been evicted by a fast worker
        if let Err(e) = self.registry.set_execute_job(&pipeline_id, handle).await {
            debug!(pipeline_id = %pipeline_id, error = %e, "Run settled before its job handle was recorded");
        }

        Ok(pipeline_id)
    }

    /// Runs the `execute` job for `handle`, recording the handle on the run
    /// so phase progress reaches it.
    pub async fn execute_job(&self, handle: JobHandle, payload: ExecutePayload) -> PipelineResult {
        self.registry
            .adopt(&payload.pipeline_id, &payload.context.task_id, &payload.config)
            .await;
        if let Err(e) = self
            .registry
            .set_execute_job(&payload.pipeline_id, handle)
            .await
        {
            debug!(pipeline_id = %payload.pipeline_id, error = %e, "Could not record execute job");
        }

        self.execute_pipeline(&payload.pipeline_id, &payload.context, &payload.config)
            .await
    }

    /// Drives a run through all phases and returns its terminal summary.
    ///
    /// Never fails: any error ends the run in `FAILED` with the root message
    /// in `error`, keeping the phases and subtasks produced so far. The run
    /// is evicted from the registry on return.
    ///
    /// `duration_ms` spans `started_at` to `completed_at`, so a run started
    /// with `start_pipeline` includes the time its `execute` job waited.
    pub async fn execute_pipeline(
        &self,
        pipeline_id: &str,
        context: &PipelineContext,
        config: &PipelineConfig,
    ) -> PipelineResult {
        let started_at = self
            .registry
            .get(pipeline_id)
            .await
            .map(|run| run.started_at)
            .unwrap_or_else(Utc::now);

        if self
            .registry
            .adopt(pipeline_id, &context.task_id, config)
            .await
        {
            debug!(pipeline_id = %pipeline_id, "Adopted pipeline run");
        }
        self.refresh_active_gauge().await;

        let mut progress = RunProgress::default();
        let outcome = self
            .run_phases(pipeline_id, context, config, &mut progress)
            .await;

        let outcome = match outcome {
            Ok(()) => {
                self.transition(pipeline_id, &context.task_id, PipelineState::Completed, config)
                    .await
            }
            Err(e) => Err(e),
        };

        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        let (state, error) = match outcome {
            Ok(_) => {
                info!(
                    pipeline_id = %pipeline_id,
                    task_id = %context.task_id,
                    duration_ms = duration_ms,
                    subtasks = progress.subtasks.len(),
                    "Pipeline completed"
                );
                self.emit(PipelineEvent::completed(pipeline_id, duration_ms));
                (PipelineState::Completed, None)
            }
            Err(e) => {
                let message = e.root_message();
                error!(
                    pipeline_id = %pipeline_id,
                    task_id = %context.task_id,
                    error = %message,
                    "Pipeline failed"
                );
                self.mark_failed(pipeline_id, &context.task_id, config).await;
                self.emit(PipelineEvent::failed(pipeline_id, message.clone()));
                (PipelineState::Failed, Some(message))
            }
        };

        self.metrics
            .record_pipeline(state.as_str(), duration_ms as f64 / 1000.0);
        self.evict(pipeline_id).await;

        PipelineResult {
            pipeline_id: pipeline_id.to_string(),
            task_id: context.task_id.clone(),
            state,
            phases: progress.phases,
            subtasks: progress.subtasks,
            prompts: progress.prompts,
            started_at,
            completed_at,
            duration_ms,
            error,
        }
    }

    async fn run_phases(
        &self,
        pipeline_id: &str,
        context: &PipelineContext,
        config: &PipelineConfig,
        progress: &mut RunProgress,
    ) -> Result<(), PipelineError> {
        for phase in PhaseKind::ALL {
            self.transition(pipeline_id, &context.task_id, phase.pipeline_state(), config)
                .await?;

            info!(pipeline_id = %pipeline_id, phase = %phase, "Executing phase");
            self.emit(PipelineEvent::phase_started(pipeline_id, phase));

            let result = match phase {
                PhaseKind::Decomposition => {
                    self.execute_decomposition_phase(pipeline_id, context, config)
                        .await?
                }
                PhaseKind::Enrichment => {
                    self.execute_enrichment_phase(pipeline_id, context, &progress.subtasks, config)
                        .await?
                }
                PhaseKind::PromptGeneration => {
                    let (result, prompts) =
                        self.render_prompts(pipeline_id, context, &progress.subtasks)?;
                    progress.prompts = prompts;
                    result
                }
            };

            self.record_phase(pipeline_id, &result);
            let failure = (!result.success).then(|| {
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{} phase failed", phase))
            });
            if let Some(generated) = &result.subtasks_generated {
                progress.subtasks = generated.clone();
            }
            progress.phases.push(result);

            if let Some(message) = failure {
                return Err(PipelineError::PhaseExecution { phase, message });
            }

            if config.enable_checkpoints {
                let mut data = Map::new();
                data.insert("subtasks".to_string(), serde_json::to_value(&progress.subtasks)?);
                data.insert(phase.checkpoint_marker().to_string(), Value::Bool(true));
                self.checkpoint(pipeline_id, phase.index(), data, config)
                    .await?;
            }

            self.report_progress(pipeline_id, phase.progress_percent())
                .await;
        }

        Ok(())
    }

    /// Runs the `decompose` job for the task and wraps its outcome.
    ///
    /// A job that exhausts its attempts is a failed `PhaseResult`; only
    /// dispatch and infrastructure problems are errors.
    pub async fn execute_decomposition_phase(
        &self,
        pipeline_id: &str,
        context: &PipelineContext,
        config: &PipelineConfig,
    ) -> Result<PhaseResult, PipelineError> {
        let phase = PhaseKind::Decomposition;
        let task = self.load_task(&context.task_id).await?;

        let payload = serde_json::to_value(DecomposePayload {
            pipeline_id: pipeline_id.to_string(),
            task_id: task.id.clone(),
            task_description: task.description,
            context: context.clone(),
        })?;

        self.dispatch_phase(
            pipeline_id,
            phase,
            queues::DECOMPOSITION,
            job_names::DECOMPOSE,
            payload,
            config,
            |value| {
                let output: DecomposeOutput = serde_json::from_value(value)?;
                let mut map = Map::new();
                map.insert("subtasks".into(), serde_json::to_value(&output.subtasks)?);
                map.insert("metadata".into(), serde_json::to_value(&output.metadata)?);
                Ok((map, output.subtasks))
            },
        )
        .await
    }

    /// Runs the `enrich` job over `subtasks` and wraps its outcome.
    pub async fn execute_enrichment_phase(
        &self,
        pipeline_id: &str,
        context: &PipelineContext,
        subtasks: &[SubtaskData],
        config: &PipelineConfig,
    ) -> Result<PhaseResult, PipelineError> {
        let phase = PhaseKind::Enrichment;

        let payload = serde_json::to_value(EnrichPayload {
            pipeline_id: pipeline_id.to_string(),
            task_id: context.task_id.clone(),
            subtasks: subtasks.to_vec(),
            context: context.clone(),
        })?;

        self.dispatch_phase(
            pipeline_id,
            phase,
            queues::ENRICHMENT,
            job_names::ENRICH,
            payload,
            config,
            |value| {
                let output: EnrichOutput = serde_json::from_value(value)?;
                let mut map = Map::new();
                map.insert(
                    "enrichedSubtasks".into(),
                    serde_json::to_value(&output.enriched_subtasks)?,
                );
                map.insert("metadata".into(), serde_json::to_value(&output.metadata)?);
                Ok((map, output.enriched_subtasks))
            },
        )
        .await
    }

    /// Groups subtasks by category and renders one prompt per group.
    pub fn generate_prompts(
        &self,
        pipeline_id: &str,
        context: &PipelineContext,
        subtasks: &[SubtaskData],
    ) -> Result<PhaseResult, PipelineError> {
        self.render_prompts(pipeline_id, context, subtasks)
            .map(|(result, _)| result)
    }

    fn render_prompts(
        &self,
        pipeline_id: &str,
        context: &PipelineContext,
        subtasks: &[SubtaskData],
    ) -> Result<(PhaseResult, Vec<GeneratedPrompt>), PipelineError> {
        let phase = PhaseKind::PromptGeneration;
        let phase_key = phase_key(pipeline_id, phase);
        let started = Instant::now();

        let mut tracker = PhaseTracker::start(&self.machine, phase_key)?;

        let result = match self.prompts.render(context, subtasks) {
            Ok(prompts) => {
                let state = tracker.finish(true)?;
                let mut output = Map::new();
                output.insert("promptCount".into(), json!(prompts.len()));
                output.insert("prompts".into(), serde_json::to_value(&prompts)?);
                debug!(pipeline_id = %pipeline_id, prompts = prompts.len(), "Prompts generated");
                (
                    PhaseResult::success(phase, output, elapsed_ms(started), 1, None)
                        .with_state(state),
                    prompts,
                )
            }
            Err(e) => {
                let state = tracker.finish(false)?;
                let message = PipelineError::Render(e).to_string();
                (
                    PhaseResult::failure(phase, message, elapsed_ms(started), 1).with_state(state),
                    Vec::new(),
                )
            }
        };

        Ok(result)
    }

    /// Sends a pause signal to the run's `execute` job.
    ///
    /// Advisory: the pipeline state is unchanged and in-flight phases finish.
    pub async fn pause_pipeline(&self, pipeline_id: &str) -> Result<(), PipelineError> {
        let run = self.require_run(pipeline_id).await?;
        self.signal(&run, ProgressUpdate::pause()).await?;

        info!(pipeline_id = %pipeline_id, "Pause requested");
        self.emit(PipelineEvent::pause_requested(pipeline_id));
        Ok(())
    }

    /// Sends a resume signal, optionally naming the checkpoint to resume from.
    pub async fn resume_pipeline(
        &self,
        pipeline_id: &str,
        checkpoint_id: Option<String>,
    ) -> Result<(), PipelineError> {
        let run = self.require_run(pipeline_id).await?;
        self.signal(&run, ProgressUpdate::resume(checkpoint_id.clone()))
            .await?;

        info!(pipeline_id = %pipeline_id, checkpoint_id = ?checkpoint_id, "Resume requested");
        self.emit(PipelineEvent::resume_requested(pipeline_id, checkpoint_id));
        Ok(())
    }

    /// Resets the run's state to the one captured by `checkpoint_id`.
    ///
    /// Only the in-memory state moves; subtasks already written and jobs
    /// already run are left as they are.
    pub async fn rollback_to_checkpoint(
        &self,
        pipeline_id: &str,
        checkpoint_id: &str,
    ) -> Result<PipelineCheckpoint, PipelineError> {
        let checkpoint = self
            .registry
            .find_checkpoint(pipeline_id, checkpoint_id)
            .await?;
        let previous = self
            .registry
            .set_state(pipeline_id, checkpoint.state)
            .await?;

        info!(
            pipeline_id = %pipeline_id,
            checkpoint_id = %checkpoint_id,
            from = %previous,
            to = %checkpoint.state,
            "Rolled back to checkpoint"
        );

        if let Some(run) = self.registry.get(pipeline_id).await {
            if run.config.enable_audit_log {
                info!(
                    target: AUDIT_TARGET,
                    pipeline_id = %pipeline_id,
                    task_id = %run.task_id,
                    checkpoint_id = %checkpoint_id,
                    state = %checkpoint.state,
                    "Pipeline rollback"
                );
            }
            self.projector.project(&run.task_id, checkpoint.state).await;
        }

        self.emit(PipelineEvent::rolled_back(
            pipeline_id,
            checkpoint_id,
            checkpoint.state,
        ));
        Ok(checkpoint)
    }

    /// Current state of an active run.
    pub async fn get_pipeline_state(&self, pipeline_id: &str) -> Option<PipelineState> {
        self.registry.state(pipeline_id).await
    }

    /// Checkpoints of an active run, oldest first.
    pub async fn get_checkpoints(&self, pipeline_id: &str) -> Vec<PipelineCheckpoint> {
        self.registry.checkpoints(pipeline_id).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_phase<F>(
        &self,
        pipeline_id: &str,
        phase: PhaseKind,
        queue: &str,
        job_name: &str,
        payload: Value,
        config: &PipelineConfig,
        decode: F,
    ) -> Result<PhaseResult, PipelineError>
    where
        F: FnOnce(Value) -> Result<(Map<String, Value>, Vec<SubtaskData>), serde_json::Error>,
    {
        let phase_key = phase_key(pipeline_id, phase);
        let started = Instant::now();

        let mut tracker = PhaseTracker::start(&self.machine, phase_key)?;

        let options = config.phase_job_options();
        let handle = self
            .queue
            .enqueue(queue, job_name, payload, options.clone())
            .await?;

        debug!(
            pipeline_id = %pipeline_id,
            phase = %phase,
            job_id = %handle.id,
            attempts = options.attempts,
            "Phase job enqueued"
        );

        match self.queue.await_result(&handle).await {
            Ok(value) => {
                let (output, subtasks) = decode(value)?;
                let attempts = self.settled_attempts(&handle).await;
                tracker.replay_retries(attempts)?;
                let state = tracker.finish(true)?;

                debug!(
                    pipeline_id = %pipeline_id,
                    phase = %phase,
                    job_id = %handle.id,
                    attempt = attempts,
                    subtasks = subtasks.len(),
                    "Phase job completed"
                );
                Ok(PhaseResult::success(
                    phase,
                    output,
                    elapsed_ms(started),
                    attempts,
                    Some(subtasks),
                )
                .with_state(state))
            }
            Err(QueueError::JobFailed {
                attempts, message, ..
            }) => {
                tracker.replay_retries(attempts)?;
                let state = tracker.finish(false)?;

                warn!(
                    pipeline_id = %pipeline_id,
                    phase = %phase,
                    job_id = %handle.id,
                    attempt = attempts,
                    error = %message,
                    "Phase job exhausted its attempts"
                );
                Ok(
                    PhaseResult::failure(phase, message, elapsed_ms(started), attempts)
                        .with_state(state),
                )
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Attempts spent on a settled job; a job the queue has already released
    /// counts as one.
    async fn settled_attempts(&self, handle: &JobHandle) -> u32 {
        match self.queue.attempts(handle).await {
            Ok(Some(attempts)) => attempts,
            Ok(None) => 1,
            Err(e) => {
                warn!(job_id = %handle.id, error = %e, "Attempt count unavailable");
                1
            }
        }
    }

    async fn load_task(&self, task_id: &str) -> Result<Task, PipelineError> {
        self.tasks
            .find_task(task_id)
            .await?
            .ok_or_else(|| PipelineError::TaskNotFound(task_id.to_string()))
    }

    async fn require_run(&self, pipeline_id: &str) -> Result<PipelineRun, PipelineError> {
        self.registry
            .get(pipeline_id)
            .await
            .ok_or_else(|| PipelineError::PipelineNotFound(pipeline_id.to_string()))
    }

    async fn signal(&self, run: &PipelineRun, update: ProgressUpdate) -> Result<(), PipelineError> {
        match &run.execute_job {
            Some(handle) => Ok(self.queue.update_progress(handle, update).await?),
            None => {
                debug!(pipeline_id = %run.pipeline_id, "No execute job to signal");
                Ok(())
            }
        }
    }

    /// Validates and applies a pipeline transition, then audits, broadcasts
    /// and projects it.
    async fn transition(
        &self,
        pipeline_id: &str,
        task_id: &str,
        to: PipelineState,
        config: &PipelineConfig,
    ) -> Result<PipelineState, PipelineError> {
        let from = self
            .registry
            .transition(pipeline_id, to, &self.machine)
            .await?;

        debug!(pipeline_id = %pipeline_id, from = %from, to = %to, "Pipeline transition");
        if config.enable_audit_log {
            info!(
                target: AUDIT_TARGET,
                pipeline_id = %pipeline_id,
                task_id = %task_id,
                from = %from,
                to = %to,
                "Pipeline state transition"
            );
        }

        self.emit(PipelineEvent::state_changed(pipeline_id, from, to));
        self.projector.project(task_id, to).await;
        Ok(from)
    }

    async fn checkpoint(
        &self,
        pipeline_id: &str,
        current_phase: u32,
        data: Map<String, Value>,
        config: &PipelineConfig,
    ) -> Result<PipelineCheckpoint, PipelineError> {
        let checkpoint = self
            .registry
            .append_checkpoint(pipeline_id, current_phase, data)
            .await?;

        debug!(
            pipeline_id = %pipeline_id,
            checkpoint_id = %checkpoint.id,
            sequence = checkpoint.sequence,
            "Checkpoint created"
        );
        if config.enable_audit_log {
            info!(
                target: AUDIT_TARGET,
                pipeline_id = %pipeline_id,
                checkpoint_id = %checkpoint.id,
                sequence = checkpoint.sequence,
                state = %checkpoint.state,
                "Pipeline checkpoint"
            );
        }

        self.emit(PipelineEvent::checkpoint_created(checkpoint.clone()));
        Ok(checkpoint)
    }

    /// Moves a run to `FAILED`, forcing the state when the transition itself
    /// is rejected so the run never stays in a phase state.
    async fn mark_failed(&self, pipeline_id: &str, task_id: &str, config: &PipelineConfig) {
        if let Err(e) = self
            .transition(pipeline_id, task_id, PipelineState::Failed, config)
            .await
        {
            warn!(pipeline_id = %pipeline_id, error = %e, "Forcing pipeline into FAILED");
            let _ = self
                .registry
                .set_state(pipeline_id, PipelineState::Failed)
                .await;
            self.projector.project(task_id, PipelineState::Failed).await;
        }
    }

    async fn abandon(&self, pipeline_id: &str, task_id: &str, config: &PipelineConfig) {
        self.mark_failed(pipeline_id, task_id, config).await;
        self.evict(pipeline_id).await;
    }

    async fn report_progress(&self, pipeline_id: &str, percent: u8) {
        let Some(handle) = self.registry.execute_job(pipeline_id).await else {
            return;
        };
        if let Err(e) = self
            .queue
            .update_progress(&handle, ProgressUpdate::percent(percent))
            .await
        {
            debug!(pipeline_id = %pipeline_id, error = %e, "Failed to report progress");
        }
    }

    fn record_phase(&self, pipeline_id: &str, result: &PhaseResult) {
        self.metrics.record_phase(
            result.phase_id.id(),
            result.success,
            result.duration_ms as f64 / 1000.0,
        );
        self.emit(PipelineEvent::phase_finished(
            pipeline_id,
            result.phase_id,
            result.success,
            result.duration_ms,
        ));
    }

    async fn evict(&self, pipeline_id: &str) {
        self.registry.evict(pipeline_id).await;
        self.refresh_active_gauge().await;
    }

    async fn refresh_active_gauge(&self) {
        self.metrics
            .set_active_pipelines(self.registry.len().await);
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

/// Partial output accumulated while phases run.
#[derive(Default)]
struct RunProgress {
    phases: Vec<PhaseResult>,
    subtasks: Vec<SubtaskData>,
    prompts: Vec<GeneratedPrompt>,
}

fn phase_key(pipeline_id: &str, phase: PhaseKind) -> String {
    format!("{}/{}", pipeline_id, phase)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// State of one phase execution, advanced only through the state machine.
struct PhaseTracker<'a> {
    machine: &'a StateMachine,
    key: String,
    state: PhaseState,
}

impl<'a> PhaseTracker<'a> {
    /// Enters `RUNNING` from `PENDING`.
    fn start(machine: &'a StateMachine, key: String) -> Result<Self, IllegalTransitionError> {
        let state = machine.transition_phase(PhaseState::Pending, PhaseState::Running, &key)?;
        Ok(Self {
            machine,
            key,
            state,
        })
    }

    fn advance(&mut self, to: PhaseState) -> Result<PhaseState, IllegalTransitionError> {
        self.state = self.machine.transition_phase(self.state, to, &self.key)?;
        Ok(self.state)
    }

    /// Replays the retries the queue reported: every attempt after the first
    /// is `RUNNING -> RETRYING -> RUNNING`.
    fn replay_retries(&mut self, attempts: u32) -> Result<(), IllegalTransitionError> {
        for attempt in 2..=attempts {
            self.advance(PhaseState::Retrying)?;
            self.advance(PhaseState::Running)?;
            debug!(phase_key = %self.key, attempt = attempt, "Phase retried");
        }
        Ok(())
    }

    /// Ends the execution in `COMPLETED` or `FAILED`.
    fn finish(&mut self, success: bool) -> Result<PhaseState, IllegalTransitionError> {
        self.advance(if success {
            PhaseState::Completed
        } else {
            PhaseState::Failed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::RetryStrategy;
    use crate::scheduler::{InMemoryJobQueue, Job, JobError, JobHandler};
    use crate::storage::{InMemoryStore, TaskStatus};
    use async_trait::async_trait;

    struct FixedDecomposer;

    #[async_trait]
    impl JobHandler for FixedDecomposer {
        async fn handle(&self, job: &Job) -> Result<Value, JobError> {
            let payload: DecomposePayload = serde_json::from_value(job.payload.clone())?;
            Ok(json!({
                "subtasks": [
                    {"category": "backend", "title": "API", "description": payload.task_description},
                    {"category": "frontend", "title": "UI", "description": "screens"},
                ],
                "metadata": {
                    "taskId": payload.task_id,
                    "pipelineId": payload.pipeline_id,
                    "subtaskCount": 2,
                    "timestamp": Utc::now(),
                }
            }))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        async fn handle(&self, _job: &Job) -> Result<Value, JobError> {
            Err(JobError::fatal("worker rejected payload"))
        }
    }

    async fn setup() -> (Arc<InMemoryJobQueue>, Arc<InMemoryStore>, PipelineOrchestrator) {
        let queue = Arc::new(InMemoryJobQueue::new());
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_task(Task::new("task-1", "Login", "Build the login flow"))
            .await;
        let orchestrator =
            PipelineOrchestrator::new(queue.clone(), store.clone(), PipelineConfig::default())
                .unwrap();
        (queue, store, orchestrator)
    }

    #[tokio::test]
    async fn test_decomposition_phase_wraps_job_output() {
        let (queue, _store, orchestrator) = setup().await;
        queue
            .register_handler(queues::DECOMPOSITION, Arc::new(FixedDecomposer))
            .await;

        let result = orchestrator
            .execute_decomposition_phase(
                "p-1",
                &PipelineContext::new("task-1"),
                &PipelineConfig::default(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.state, PhaseState::Completed);
        assert_eq!(result.attempts, 1);
        let subtasks = result.subtasks_generated.unwrap();
        assert_eq!(subtasks.len(), 2);
        assert_eq!(subtasks[0].description, "Build the login flow");
        assert!(result.output.contains_key("metadata"));
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_failed_phase_result() {
        let (queue, _store, orchestrator) = setup().await;
        queue
            .register_handler(queues::ENRICHMENT, Arc::new(FailingHandler))
            .await;

        let result = orchestrator
            .execute_enrichment_phase(
                "p-1",
                &PipelineContext::new("task-1"),
                &[],
                &PipelineConfig::default(),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.state, PhaseState::Failed);
        assert_eq!(result.error.as_deref(), Some("worker rejected payload"));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_phase_dispatch_error_is_err() {
        let (_queue, _store, orchestrator) = setup().await;

        // No handler registered for the decomposition queue
        let err = orchestrator
            .execute_decomposition_phase(
                "p-1",
                &PipelineContext::new("task-1"),
                &PipelineConfig::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Queue(_)));
    }

    #[tokio::test]
    async fn test_generate_prompts_counts_categories() {
        let (_queue, _store, orchestrator) = setup().await;
        let subtasks = vec![
            SubtaskData::new("backend", "A", "a"),
            SubtaskData::new("backend", "B", "b"),
            SubtaskData::new("infra", "C", "c"),
        ];

        let result = orchestrator
            .generate_prompts("p-1", &PipelineContext::new("task-1"), &subtasks)
            .unwrap();

        assert!(result.success);
        assert_eq!(result.output["promptCount"], 2);
        assert!(result.subtasks_generated.is_none());
    }

    #[tokio::test]
    async fn test_start_pipeline_unknown_task() {
        let (_queue, _store, orchestrator) = setup().await;

        let err = orchestrator
            .start_pipeline(PipelineContext::new("missing"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::TaskNotFound(_)));
        assert!(orchestrator.active_pipelines().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_pipeline_enqueue_failure_fails_task() {
        let (_queue, store, orchestrator) = setup().await;

        // Nothing consumes the pipeline queue
        let err = orchestrator
            .start_pipeline(PipelineContext::new("task-1"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Queue(_)));
        assert!(orchestrator.active_pipelines().await.is_empty());
        assert_eq!(
            store.status_history("task-1").await,
            vec![TaskStatus::Pending, TaskStatus::Failed]
        );
    }

    #[tokio::test]
    async fn test_start_pipeline_rejects_invalid_overrides() {
        let (_queue, _store, orchestrator) = setup().await;
        let overrides = PipelineConfigOverrides {
            timeout_ms: Some(0),
            ..Default::default()
        };

        let err = orchestrator
            .start_pipeline(PipelineContext::new("task-1"), Some(overrides))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(orchestrator.active_pipelines().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_pipeline_controls() {
        let (_queue, _store, orchestrator) = setup().await;

        assert!(orchestrator
            .pause_pipeline("nope")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(orchestrator
            .resume_pipeline("nope", None)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(orchestrator
            .rollback_to_checkpoint("nope", "cp")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(orchestrator.get_pipeline_state("nope").await.is_none());
        assert!(orchestrator.get_checkpoints("nope").await.is_empty());
    }

    struct RetryableFailure;

    #[async_trait]
    impl JobHandler for RetryableFailure {
        async fn handle(&self, _job: &Job) -> Result<Value, JobError> {
            Err(JobError::retryable("enricher busy"))
        }
    }

    #[test]
    fn test_phase_tracker_replays_retries() {
        let machine = StateMachine::new();
        let mut tracker = PhaseTracker::start(&machine, "p-1/decomposition".into()).unwrap();
        assert_eq!(tracker.state, PhaseState::Running);

        tracker.replay_retries(3).unwrap();
        assert_eq!(tracker.state, PhaseState::Running);
        assert_eq!(tracker.finish(true).unwrap(), PhaseState::Completed);

        // Terminal: no further moves are accepted
        let err = tracker.finish(false).unwrap_err();
        assert_eq!(err.id, "p-1/decomposition");
        assert_eq!(tracker.state, PhaseState::Completed);
    }

    #[tokio::test]
    async fn test_exhausted_retries_end_phase_failed() {
        let (queue, _store, orchestrator) = setup().await;
        queue
            .register_handler(queues::ENRICHMENT, Arc::new(RetryableFailure))
            .await;
        let config = PipelineConfig::default().with_retry_strategy(RetryStrategy {
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1,
            max_delay_ms: 5,
        });

        let result = orchestrator
            .execute_enrichment_phase("p-1", &PipelineContext::new("task-1"), &[], &config)
            .await
            .unwrap();

        assert_eq!(result.state, PhaseState::Failed);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.error.as_deref(), Some("enricher busy"));
    }

    #[tokio::test]
    async fn test_duration_spans_started_to_completed() {
        let (_queue, _store, orchestrator) = setup().await;
        let config = PipelineConfig::default();
        orchestrator
            .registry
            .register(PipelineRun::new(
                "p-wait",
                "task-1",
                PipelineState::Initializing,
                config.clone(),
            ))
            .await;

        // Time spent queued before a worker picks the run up
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        // No phase handlers: the run fails at decomposition
        let result = orchestrator
            .execute_pipeline("p-wait", &PipelineContext::new("task-1"), &config)
            .await;

        assert_eq!(result.state, PipelineState::Failed);
        assert!(result.duration_ms >= 30);
        assert_eq!(
            result.duration_ms,
            (result.completed_at - result.started_at).num_milliseconds() as u64
        );
    }

    #[test]
    fn test_phase_key() {
        assert_eq!(
            phase_key("p-1", PhaseKind::PromptGeneration),
            "p-1/prompt-generation"
        );
    }
}
