//! Lifecycle events broadcast by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::checkpoint::PipelineCheckpoint;
use super::types::PhaseKind;
use crate::state_machine::PipelineState;

/// Events emitted while a pipeline runs, for observers and audit consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// Pipeline state changed.
    StateChanged {
        pipeline_id: String,
        from: PipelineState,
        to: PipelineState,
        timestamp: DateTime<Utc>,
    },
    /// A phase was dispatched.
    PhaseStarted {
        pipeline_id: String,
        phase: PhaseKind,
        timestamp: DateTime<Utc>,
    },
    /// A phase produced its final result.
    PhaseFinished {
        pipeline_id: String,
        phase: PhaseKind,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A checkpoint was appended.
    CheckpointCreated {
        checkpoint: PipelineCheckpoint,
        timestamp: DateTime<Utc>,
    },
    /// Pause signal sent to the execute job.
    PauseRequested {
        pipeline_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Resume signal sent to the execute job.
    ResumeRequested {
        pipeline_id: String,
        checkpoint_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// State reset to a checkpoint.
    RolledBack {
        pipeline_id: String,
        checkpoint_id: String,
        state: PipelineState,
        timestamp: DateTime<Utc>,
    },
    /// Run finished in `COMPLETED`.
    Completed {
        pipeline_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// Run finished in `FAILED`.
    Failed {
        pipeline_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn state_changed(pipeline_id: &str, from: PipelineState, to: PipelineState) -> Self {
        Self::StateChanged {
            pipeline_id: pipeline_id.to_string(),
            from,
            to,
            timestamp: Utc::now(),
        }
    }

    pub fn phase_started(pipeline_id: &str, phase: PhaseKind) -> Self {
        Self::PhaseStarted {
            pipeline_id: pipeline_id.to_string(),
            phase,
            timestamp: Utc::now(),
        }
    }

    pub fn phase_finished(
        pipeline_id: &str,
        phase: PhaseKind,
        success: bool,
        duration_ms: u64,
    ) -> Self {
        Self::PhaseFinished {
            pipeline_id: pipeline_id.to_string(),
            phase,
            success,
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn checkpoint_created(checkpoint: PipelineCheckpoint) -> Self {
        Self::CheckpointCreated {
            checkpoint,
            timestamp: Utc::now(),
        }
    }

    pub fn pause_requested(pipeline_id: &str) -> Self {
        Self::PauseRequested {
            pipeline_id: pipeline_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn resume_requested(pipeline_id: &str, checkpoint_id: Option<String>) -> Self {
        Self::ResumeRequested {
            pipeline_id: pipeline_id.to_string(),
            checkpoint_id,
            timestamp: Utc::now(),
        }
    }

    pub fn rolled_back(pipeline_id: &str, checkpoint_id: &str, state: PipelineState) -> Self {
        Self::RolledBack {
            pipeline_id: pipeline_id.to_string(),
            checkpoint_id: checkpoint_id.to_string(),
            state,
            timestamp: Utc::now(),
        }
    }

    pub fn completed(pipeline_id: &str, duration_ms: u64) -> Self {
        Self::Completed {
            pipeline_id: pipeline_id.to_string(),
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(pipeline_id: &str, error: impl Into<String>) -> Self {
        Self::Failed {
            pipeline_id: pipeline_id.to_string(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    /// Pipeline the event belongs to.
    pub fn pipeline_id(&self) -> &str {
        match self {
            Self::StateChanged { pipeline_id, .. }
            | Self::PhaseStarted { pipeline_id, .. }
            | Self::PhaseFinished { pipeline_id, .. }
            | Self::PauseRequested { pipeline_id, .. }
            | Self::ResumeRequested { pipeline_id, .. }
            | Self::RolledBack { pipeline_id, .. }
            | Self::Completed { pipeline_id, .. }
            | Self::Failed { pipeline_id, .. } => pipeline_id,
            Self::CheckpointCreated { checkpoint, .. } => &checkpoint.pipeline_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::StateChanged { timestamp, .. }
            | Self::PhaseStarted { timestamp, .. }
            | Self::PhaseFinished { timestamp, .. }
            | Self::CheckpointCreated { timestamp, .. }
            | Self::PauseRequested { timestamp, .. }
            | Self::ResumeRequested { timestamp, .. }
            | Self::RolledBack { timestamp, .. }
            | Self::Completed { timestamp, .. }
            | Self::Failed { timestamp, .. } => *timestamp,
        }
    }

    /// Whether the event ends the run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::checkpoint::CheckpointLog;
    use serde_json::Map;

    #[test]
    fn test_pipeline_id_for_every_variant() {
        let mut log = CheckpointLog::new();
        let cp = log.append("p-1", PipelineState::Decomposing, 1, Map::new());

        let events = vec![
            PipelineEvent::state_changed("p-1", PipelineState::Idle, PipelineState::Initializing),
            PipelineEvent::phase_started("p-1", PhaseKind::Decomposition),
            PipelineEvent::phase_finished("p-1", PhaseKind::Decomposition, true, 12),
            PipelineEvent::checkpoint_created(cp),
            PipelineEvent::pause_requested("p-1"),
            PipelineEvent::resume_requested("p-1", None),
            PipelineEvent::rolled_back("p-1", "cp", PipelineState::Decomposing),
            PipelineEvent::completed("p-1", 40),
            PipelineEvent::failed("p-1", "boom"),
        ];

        for event in &events {
            assert_eq!(event.pipeline_id(), "p-1");
            assert!(event.timestamp() <= Utc::now());
        }
        let terminal = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminal, 2);
    }

    #[test]
    fn test_event_serializes_with_variant_tag() {
        let event = PipelineEvent::failed("p-1", "decomposer crashed");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["Failed"]["error"], "decomposer crashed");
    }
}
