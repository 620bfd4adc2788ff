//! Append-only checkpoint log kept per pipeline run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::state_machine::PipelineState;

/// Immutable snapshot of a run's state and accumulated data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineCheckpoint {
    pub id: String,
    pub pipeline_id: String,
    /// Position in the run's log, starting at 1.
    pub sequence: u64,
    pub state: PipelineState,
    pub current_phase: u32,
    pub data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// Checkpoints of one run, in creation order.
#[derive(Debug, Clone, Default)]
pub struct CheckpointLog {
    entries: Vec<PipelineCheckpoint>,
}

impl CheckpointLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new checkpoint and returns a copy of it.
    pub fn append(
        &mut self,
        pipeline_id: &str,
        state: PipelineState,
        current_phase: u32,
        data: Map<String, Value>,
    ) -> PipelineCheckpoint {
        let sequence = self.entries.last().map_or(1, |last| last.sequence + 1);
        let checkpoint = PipelineCheckpoint {
            id: Uuid::new_v4().to_string(),
            pipeline_id: pipeline_id.to_string(),
            sequence,
            state,
            current_phase,
            data,
            created_at: Utc::now(),
        };
        self.entries.push(checkpoint.clone());
        checkpoint
    }

    pub fn find(&self, checkpoint_id: &str) -> Option<&PipelineCheckpoint> {
        self.entries.iter().find(|c| c.id == checkpoint_id)
    }

    pub fn latest(&self) -> Option<&PipelineCheckpoint> {
        self.entries.last()
    }

    pub fn entries(&self) -> &[PipelineCheckpoint] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
