//! In-memory task and subtask store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::store::{
    index_subtasks, StoreError, StoredSubtask, SubtaskStore, Task, TaskStatus, TaskStore,
};
use crate::pipeline::types::SubtaskData;

/// Process-local store implementing both collaborator traits.
///
/// Keeps every status write per task so callers can inspect the projection
/// history.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tasks: RwLock<HashMap<String, Task>>,
    status_history: RwLock<HashMap<String, Vec<TaskStatus>>>,
    subtasks: RwLock<HashMap<String, BTreeMap<u32, SubtaskData>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a task.
    pub async fn insert_task(&self, task: Task) {
        self.tasks.write().await.insert(task.id.clone(), task);
    }

    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// Every status written for `task_id`, oldest first.
    pub async fn status_history(&self, task_id: &str) -> Vec<TaskStatus> {
        self.status_history
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    fn collect(task_id: &str, rows: &BTreeMap<u32, SubtaskData>) -> Vec<StoredSubtask> {
        rows.iter()
            .map(|(index, data)| StoredSubtask {
                task_id: task_id.to_string(),
                order_index: *index,
                data: data.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn find_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.task(task_id).await)
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
        task.status = status;

        self.status_history
            .write()
            .await
            .entry(task_id.to_string())
            .or_default()
            .push(status);
        Ok(())
    }
}

#[async_trait]
impl SubtaskStore for InMemoryStore {
    async fn create_subtasks(
        &self,
        task_id: &str,
        subtasks: &[SubtaskData],
    ) -> Result<Vec<StoredSubtask>, StoreError> {
        let stored = index_subtasks(task_id, subtasks);
        let rows = stored
            .iter()
            .map(|s| (s.order_index, s.data.clone()))
            .collect();
        self.subtasks
            .write()
            .await
            .insert(task_id.to_string(), rows);
        Ok(stored)
    }

    async fn update_subtasks(
        &self,
        task_id: &str,
        subtasks: &[SubtaskData],
    ) -> Result<Vec<StoredSubtask>, StoreError> {
        let stored = index_subtasks(task_id, subtasks);
        let mut all = self.subtasks.write().await;
        let rows = all.entry(task_id.to_string()).or_default();
        for s in &stored {
            rows.insert(s.order_index, s.data.clone());
        }
        Ok(stored)
    }

    async fn list_subtasks(&self, task_id: &str) -> Result<Vec<StoredSubtask>, StoreError> {
        Ok(self
            .subtasks
            .read()
            .await
            .get(task_id)
            .map(|rows| Self::collect(task_id, rows))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subtask(title: &str) -> SubtaskData {
        SubtaskData::new("backend", title, format!("{} description", title))
    }

    #[tokio::test]
    async fn test_find_and_update_task() {
        let store = InMemoryStore::new();
        store.insert_task(Task::new("t-1", "Title", "Desc")).await;

        let found = store.find_task("t-1").await.unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Pending);

        store
            .update_task_status("t-1", TaskStatus::InProgress)
            .await
            .unwrap();
        store
            .update_task_status("t-1", TaskStatus::Completed)
            .await
            .unwrap();

        assert_eq!(
            store.task("t-1").await.unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(
            store.status_history("t-1").await,
            vec![TaskStatus::InProgress, TaskStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_missing_task() {
        let store = InMemoryStore::new();
        assert!(store.find_task("nope").await.unwrap().is_none());

        let err = store
            .update_task_status("nope", TaskStatus::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.status_history("nope").await.is_empty());
    }

    #[tokio::test]
    async fn test_create_subtasks_replaces_previous_rows() {
        let store = InMemoryStore::new();
        store
            .create_subtasks("t-1", &[subtask("a"), subtask("b"), subtask("c")])
            .await
            .unwrap();
        // Redelivered decomposition with fewer results
        store
            .create_subtasks("t-1", &[subtask("x"), subtask("y")])
            .await
            .unwrap();

        let listed = store.list_subtasks("t-1").await.unwrap();
        let titles: Vec<&str> = listed.iter().map(|s| s.data.title.as_str()).collect();
        assert_eq!(titles, ["x", "y"]);
    }

    #[tokio::test]
    async fn test_update_subtasks_is_idempotent_upsert() {
        let store = InMemoryStore::new();
        store
            .create_subtasks("t-1", &[subtask("a"), subtask("b")])
            .await
            .unwrap();

        let enriched = vec![subtask("a").with_priority("high")];
        store.update_subtasks("t-1", &enriched).await.unwrap();
        store.update_subtasks("t-1", &enriched).await.unwrap();

        let listed = store.list_subtasks("t-1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].data.priority.as_deref(), Some("high"));
        assert_eq!(listed[1].data.title, "b");
        assert_eq!(listed[1].order_index, 1);
    }

    #[tokio::test]
    async fn test_list_subtasks_unknown_task_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.list_subtasks("t-9").await.unwrap().is_empty());
    }
}
