//! Projection of pipeline state onto the external task status.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::state_machine::PipelineState;
use crate::storage::{TaskStatus, TaskStore};

/// Task status written for a pipeline state, `None` when nothing is written.
pub fn task_status_for(state: PipelineState) -> Option<TaskStatus> {
    match state {
        PipelineState::Idle | PipelineState::Initializing => Some(TaskStatus::Pending),
        PipelineState::Decomposing
        | PipelineState::Enriching
        | PipelineState::GeneratingPrompts
        | PipelineState::Paused => Some(TaskStatus::InProgress),
        PipelineState::Completed => Some(TaskStatus::Completed),
        PipelineState::Failed => Some(TaskStatus::Failed),
        PipelineState::RolledBack => None,
    }
}

/// Best-effort writer of task status.
#[derive(Clone)]
pub struct TaskStatusProjector {
    tasks: Arc<dyn TaskStore>,
}

impl TaskStatusProjector {
    pub fn new(tasks: Arc<dyn TaskStore>) -> Self {
        Self { tasks }
    }

    /// Writes the status for `state`, surfacing store failures.
    pub async fn try_project(
        &self,
        task_id: &str,
        state: PipelineState,
    ) -> Result<Option<TaskStatus>, PipelineError> {
        let Some(status) = task_status_for(state) else {
            return Ok(None);
        };
        self.tasks
            .update_task_status(task_id, status)
            .await
            .map_err(|e| PipelineError::Projection(e.to_string()))?;
        Ok(Some(status))
    }

    /// Writes the status for `state`; failures are logged and dropped.
    pub async fn project(&self, task_id: &str, state: PipelineState) {
        match self.try_project(task_id, state).await {
            Ok(Some(status)) => {
                debug!(task_id = %task_id, state = %state, status = %status, "Projected task status")
            }
            Ok(None) => {}
            Err(e) => warn!(task_id = %task_id, state = %state, error = %e, "Failed to update task status"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStore, Task};

    #[test]
    fn test_status_mapping() {
        use PipelineState::*;

        assert_eq!(task_status_for(Idle), Some(TaskStatus::Pending));
        assert_eq!(task_status_for(Initializing), Some(TaskStatus::Pending));
        for state in [Decomposing, Enriching, GeneratingPrompts, Paused] {
            assert_eq!(task_status_for(state), Some(TaskStatus::InProgress));
        }
        assert_eq!(task_status_for(Completed), Some(TaskStatus::Completed));
        assert_eq!(task_status_for(Failed), Some(TaskStatus::Failed));
        assert_eq!(task_status_for(RolledBack), None);
    }

    #[tokio::test]
    async fn test_project_writes_status() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_task(Task::new("t-1", "Title", "Desc")).await;
        let projector = TaskStatusProjector::new(store.clone());

        projector.project("t-1", PipelineState::Enriching).await;
        projector.project("t-1", PipelineState::RolledBack).await;

        assert_eq!(
            store.status_history("t-1").await,
            vec![TaskStatus::InProgress]
        );
    }

    #[tokio::test]
    async fn test_project_swallows_store_errors() {
        let store = Arc::new(InMemoryStore::new());
        let projector = TaskStatusProjector::new(store.clone());

        let err = projector
            .try_project("missing", PipelineState::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Projection(_)));

        // Does not panic or propagate
        projector.project("missing", PipelineState::Failed).await;
    }
}
