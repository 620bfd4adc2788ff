//! Data carried through a pipeline run and across the job queues.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::config::PipelineConfig;
use crate::state_machine::{PhaseState, PipelineState};

/// One unit of work produced by decomposition.
///
/// The orchestrator never interprets these fields; it only groups by
/// `category` when rendering prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskData {
    pub category: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub estimated_effort: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

impl SubtaskData {
    pub fn new(
        category: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            title: title.into(),
            description: description.into(),
            requirements: Vec::new(),
            dependencies: Vec::new(),
            estimated_effort: None,
            priority: None,
        }
    }

    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_estimated_effort(mut self, effort: impl Into<String>) -> Self {
        self.estimated_effort = Some(effort.into());
        self
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }
}

/// Immutable per-run input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineContext {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tech_stack: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coding_standards: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub project_rules: HashMap<String, Value>,
}

impl PipelineContext {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Default::default()
        }
    }

    pub fn with_tech_stack(mut self, tech_stack: Vec<String>) -> Self {
        self.tech_stack = tech_stack;
        self
    }

    pub fn with_coding_standards(mut self, standards: Vec<String>) -> Self {
        self.coding_standards = standards;
        self
    }

    pub fn with_project_rule(mut self, key: impl Into<String>, value: Value) -> Self {
        self.project_rules.insert(key.into(), value);
        self
    }
}

/// The three phases of a run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    Decomposition,
    Enrichment,
    PromptGeneration,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 3] = [
        PhaseKind::Decomposition,
        PhaseKind::Enrichment,
        PhaseKind::PromptGeneration,
    ];

    /// Stable identifier used in results, logs and metrics.
    pub fn id(&self) -> &'static str {
        match self {
            PhaseKind::Decomposition => "decomposition",
            PhaseKind::Enrichment => "enrichment",
            PhaseKind::PromptGeneration => "prompt-generation",
        }
    }

    /// 1-based position in the run, recorded as a checkpoint's current phase.
    pub fn index(&self) -> u32 {
        match self {
            PhaseKind::Decomposition => 1,
            PhaseKind::Enrichment => 2,
            PhaseKind::PromptGeneration => 3,
        }
    }

    /// Pipeline state while this phase runs.
    pub fn pipeline_state(&self) -> PipelineState {
        match self {
            PhaseKind::Decomposition => PipelineState::Decomposing,
            PhaseKind::Enrichment => PipelineState::Enriching,
            PhaseKind::PromptGeneration => PipelineState::GeneratingPrompts,
        }
    }

    /// Marker key set in the checkpoint taken after this phase.
    pub fn checkpoint_marker(&self) -> &'static str {
        match self {
            PhaseKind::Decomposition => "decompositionComplete",
            PhaseKind::Enrichment => "enrichmentComplete",
            PhaseKind::PromptGeneration => "promptsGenerated",
        }
    }

    /// Job progress reported once this phase has finished.
    pub fn progress_percent(&self) -> u8 {
        match self {
            PhaseKind::Decomposition => 33,
            PhaseKind::Enrichment => 66,
            PhaseKind::PromptGeneration => 100,
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Outcome of the final attempt of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseResult {
    pub phase_id: PhaseKind,
    pub state: PhaseState,
    pub success: bool,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub attempts: u32,
    #[serde(default)]
    pub subtasks_generated: Option<Vec<SubtaskData>>,
}

impl PhaseResult {
    pub fn success(
        phase: PhaseKind,
        output: Map<String, Value>,
        duration_ms: u64,
        attempts: u32,
        subtasks: Option<Vec<SubtaskData>>,
    ) -> Self {
        Self {
            phase_id: phase,
            state: PhaseState::Completed,
            success: true,
            output,
            error: None,
            duration_ms,
            attempts,
            subtasks_generated: subtasks,
        }
    }

    pub fn failure(
        phase: PhaseKind,
        error: impl Into<String>,
        duration_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            phase_id: phase,
            state: PhaseState::Failed,
            success: false,
            output: Map::new(),
            error: Some(error.into()),
            duration_ms,
            attempts,
            subtasks_generated: None,
        }
    }

    pub fn with_state(mut self, state: PhaseState) -> Self {
        self.state = state;
        self
    }
}

/// One rendered prompt document per subtask category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedPrompt {
    pub category: String,
    pub title: String,
    pub content: String,
    pub subtask_count: usize,
}

/// Terminal summary of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub pipeline_id: String,
    pub task_id: String,
    pub state: PipelineState,
    pub phases: Vec<PhaseResult>,
    pub subtasks: Vec<SubtaskData>,
    pub prompts: Vec<GeneratedPrompt>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl PipelineResult {
    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Completed
    }

    pub fn phase(&self, kind: PhaseKind) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.phase_id == kind)
    }
}

// ============================================================================
// Job payloads
// ============================================================================

/// Payload of the `execute` job on the `pipeline` queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayload {
    pub pipeline_id: String,
    pub context: PipelineContext,
    pub config: PipelineConfig,
}

/// Payload of the `decompose` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecomposePayload {
    pub pipeline_id: String,
    pub task_id: String,
    pub task_description: String,
    pub context: PipelineContext,
}

/// Payload of the `enrich` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichPayload {
    pub pipeline_id: String,
    pub task_id: String,
    pub subtasks: Vec<SubtaskData>,
    pub context: PipelineContext,
}

/// Bookkeeping attached to every phase job result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseMetadata {
    pub task_id: String,
    pub pipeline_id: String,
    pub subtask_count: usize,
    pub timestamp: DateTime<Utc>,
}

impl PhaseMetadata {
    pub fn new(task_id: &str, pipeline_id: &str, subtask_count: usize) -> Self {
        Self {
            task_id: task_id.to_string(),
            pipeline_id: pipeline_id.to_string(),
            subtask_count,
            timestamp: Utc::now(),
        }
    }
}

/// Result of the `decompose` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecomposeOutput {
    pub subtasks: Vec<SubtaskData>,
    pub metadata: PhaseMetadata,
}

/// Result of the `enrich` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichOutput {
    pub enriched_subtasks: Vec<SubtaskData>,
    pub metadata: PhaseMetadata,
}
