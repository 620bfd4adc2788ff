//! Collaborator contracts for task and subtask records.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::migrations::MigrationError;
use crate::pipeline::types::SubtaskData;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// A stored value could not be decoded.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

/// External status of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(StoreError::InvalidData(format!(
                "unknown task status '{}'",
                other
            ))),
        }
    }
}

/// A task record as the orchestrator sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
}

impl Task {
    /// A new task in `PENDING`.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
        }
    }
}

/// A subtask persisted for a task, keyed by `(task_id, order_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSubtask {
    pub task_id: String,
    pub order_index: u32,
    pub data: SubtaskData,
}

/// Read access to tasks and the status write used by projection.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn find_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    /// Fails with `StoreError::NotFound` for an unknown task.
    async fn update_task_status(&self, task_id: &str, status: TaskStatus)
        -> Result<(), StoreError>;
}

/// Subtask persistence used by the phase workers.
///
/// Writes are upserts keyed by `(task_id, order_index)` so a redelivered job
/// converges on the same rows.
#[async_trait]
pub trait SubtaskStore: Send + Sync {
    /// Replaces the task's subtasks with `subtasks`, indexed from 0.
    async fn create_subtasks(
        &self,
        task_id: &str,
        subtasks: &[SubtaskData],
    ) -> Result<Vec<StoredSubtask>, StoreError>;

    /// Overwrites the rows at indices `0..subtasks.len()`, leaving later
    /// rows untouched.
    async fn update_subtasks(
        &self,
        task_id: &str,
        subtasks: &[SubtaskData],
    ) -> Result<Vec<StoredSubtask>, StoreError>;

    /// Subtasks of a task ordered by `order_index`.
    async fn list_subtasks(&self, task_id: &str) -> Result<Vec<StoredSubtask>, StoreError>;
}

pub(crate) fn index_subtasks(task_id: &str, subtasks: &[SubtaskData]) -> Vec<StoredSubtask> {
    subtasks
        .iter()
        .enumerate()
        .map(|(i, data)| StoredSubtask {
            task_id: task_id.to_string(),
            order_index: i as u32,
            data: data.clone(),
        })
        .collect()
}
