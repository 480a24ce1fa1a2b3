//! DeadLetterQueue: admission, manual retry, and retention cleanup for
//! permanently-failed tasks (§4.9).

use std::sync::Arc;

use chrono::Utc;

use crate::storage::{Storage, StoreError};
use crate::task::{DlqEntry, Task, TaskId, TaskPatch, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("dead letter queue is full ({current}/{max})")]
    ResourceExhausted { current: usize, max: usize },
    #[error("task {0} is not in the dead letter queue")]
    NotFound(TaskId),
    #[error("task {0} has exceeded its dead-letter retry limit ({1})")]
    RetryLimitExceeded(TaskId, u32),
}

#[derive(Debug, Clone)]
pub struct DlqConfig {
    pub max_dlq_size: usize,
    pub alert_threshold: usize,
    pub retry_limit: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_dlq_size: 1_000,
            alert_threshold: 100,
            retry_limit: 3,
        }
    }
}

/// Lifecycle manager for dead-lettered tasks, layered directly on `Storage`'s
/// DLQ methods (`move_to_dlq`, `get_dlq`, `remove_from_dlq`, `cleanup_dlq`).
pub struct DeadLetterQueue {
    storage: Arc<dyn Storage>,
    config: DlqConfig,
    // Serializes the check-then-act admission sequence below so that two
    // concurrent admitters (Scheduler::fail and RecoveryManager::tick both
    // race on the same storage) can't both observe room under max_dlq_size
    // and both proceed.
    admit_lock: tokio::sync::Mutex<()>,
}

impl DeadLetterQueue {
    pub fn new(storage: Arc<dyn Storage>, config: DlqConfig) -> Self {
        Self { storage, config, admit_lock: tokio::sync::Mutex::new(()) }
    }

    /// Admit an already-terminally-failed task into the DLQ. Rejects with
    /// `ResourceExhausted` if the queue is at capacity, leaving the task in
    /// its current (failed) status for the caller to handle.
    #[tracing::instrument(skip(self, task, error_history), fields(task_id = %task.id))]
    pub async fn admit(&self, task: Task, error_history: Vec<String>) -> Result<(), DlqError> {
        let _guard = self.admit_lock.lock().await;

        let current = self.storage.dlq_count().await?;
        if current >= self.config.max_dlq_size {
            return Err(DlqError::ResourceExhausted {
                current,
                max: self.config.max_dlq_size,
            });
        }

        self.storage.move_to_dlq(task, error_history).await?;
        tracing::error!("task dead_lettered");

        let new_count = current + 1;
        if new_count >= self.config.alert_threshold {
            tracing::warn!(count = new_count, "dlq_threshold_exceeded");
        }
        Ok(())
    }

    /// Manually re-queue a DLQ entry. Refuses once `retry_count` has already
    /// reached `dlq_retry_limit`.
    #[tracing::instrument(skip(self))]
    pub async fn retry(&self, id: TaskId) -> Result<(), DlqError> {
        let entries = self.storage.get_dlq(None).await?;
        let entry = entries
            .into_iter()
            .find(|e| e.task.id == id)
            .ok_or(DlqError::NotFound(id))?;

        if entry.task.retry_count >= self.config.retry_limit {
            return Err(DlqError::RetryLimitExceeded(id, self.config.retry_limit));
        }

        let mut task = entry.task;
        task.transition(TaskStatus::Pending, Utc::now())
            .map_err(|e| StoreError::Corrupt(e.message))?;
        task.retry_count += 1;
        task.error = None;

        self.storage
            .update_task(
                id,
                TaskPatch {
                    status: Some(TaskStatus::Pending),
                    retry_count: Some(task.retry_count),
                    error: Some(None),
                    moved_to_dlq_at: Some(None),
                    eligible_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.storage.remove_from_dlq(id).await?;
        tracing::info!(task_id = %id, "task_requeued from dlq");
        Ok(())
    }

    pub async fn list(&self, limit: Option<usize>) -> Result<Vec<DlqEntry>, DlqError> {
        Ok(self.storage.get_dlq(limit).await?)
    }

    pub async fn count(&self) -> Result<usize, DlqError> {
        Ok(self.storage.dlq_count().await?)
    }

    /// Remove entries older than `retention`. Returns the number removed.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self, retention: chrono::Duration) -> Result<usize, DlqError> {
        let cutoff = Utc::now() - retention;
        let removed = self.storage.cleanup_dlq(cutoff).await?;
        tracing::info!(removed, "dlq_tasks_cleaned");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::task::{Priority, TaskKind};

    fn dead_task() -> Task {
        let mut task = Task::new(TaskKind::Write, Priority::Normal, serde_json::json!({}));
        task.transition(TaskStatus::InProgress, Utc::now()).unwrap();
        task.transition(TaskStatus::DeadLetter, Utc::now()).unwrap();
        task
    }

    #[tokio::test]
    async fn admit_then_list_round_trips() {
        let storage = Arc::new(InMemoryStorage::new());
        let dlq = DeadLetterQueue::new(storage, DlqConfig::default());
        let task = dead_task();
        let id = task.id;
        dlq.admit(task, vec!["boom".into()]).await.unwrap();

        let entries = dlq.list(None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task.id, id);
    }

    #[tokio::test]
    async fn admit_rejects_once_full() {
        let storage = Arc::new(InMemoryStorage::new());
        let dlq = DeadLetterQueue::new(storage, DlqConfig { max_dlq_size: 1, ..Default::default() });
        dlq.admit(dead_task(), vec![]).await.unwrap();
        let err = dlq.admit(dead_task(), vec![]).await.unwrap_err();
        assert!(matches!(err, DlqError::ResourceExhausted { .. }));
    }

    #[tokio::test]
    async fn retry_requeues_and_removes_from_dlq() {
        let storage = Arc::new(InMemoryStorage::new());
        let dlq = DeadLetterQueue::new(storage.clone(), DlqConfig::default());
        let task = dead_task();
        let id = task.id;
        storage.save_task(task.clone()).await.unwrap();
        dlq.admit(task, vec!["boom".into()]).await.unwrap();

        dlq.retry(id).await.unwrap();

        assert_eq!(dlq.count().await.unwrap(), 0);
        let stored = storage.get_task(id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn retry_refuses_past_limit() {
        let storage = Arc::new(InMemoryStorage::new());
        let dlq = DeadLetterQueue::new(storage.clone(), DlqConfig { retry_limit: 0, ..Default::default() });
        let task = dead_task();
        let id = task.id;
        storage.save_task(task.clone()).await.unwrap();
        dlq.admit(task, vec![]).await.unwrap();

        let err = dlq.retry(id).await.unwrap_err();
        assert!(matches!(err, DlqError::RetryLimitExceeded(_, 0)));
    }
}
