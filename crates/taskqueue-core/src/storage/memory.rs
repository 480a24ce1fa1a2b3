//! In-memory Storage implementation, primarily for tests.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{is_claimable, HealthStatus, Storage, StoreError};
use crate::task::{DlqEntry, MetricSample, Task, TaskId, TaskPatch, TaskResult, TaskStatus};
use async_trait::async_trait;

/// In-memory implementation of `Storage`.
///
/// Stores all data behind `parking_lot` locks and provides the same
/// semantics as the PostgreSQL implementation, including single-holder
/// advisory locks (here modeled as a simple held-set rather than a real
/// connection-scoped primitive, since there is only one "connection").
pub struct InMemoryStorage {
    tasks: RwLock<HashMap<TaskId, Task>>,
    results: RwLock<HashMap<TaskId, TaskResult>>,
    metrics: RwLock<Vec<MetricSample>>,
    dlq: RwLock<HashMap<TaskId, DlqEntry>>,
    advisory_locks: RwLock<std::collections::HashSet<i64>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            metrics: RwLock::new(Vec::new()),
            dlq: RwLock::new(HashMap::new()),
            advisory_locks: RwLock::new(std::collections::HashSet::new()),
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// Clear all data (for testing).
    pub fn clear(&self) {
        self.tasks.write().clear();
        self.results.write().clear();
        self.metrics.write().clear();
        self.dlq.write().clear();
        self.advisory_locks.write().clear();
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies a patch, routing the status field (if present) through
/// `Task::transition` so an illegal status jump is rejected rather than
/// silently written.
fn apply_patch(task: &mut Task, patch: TaskPatch, now: DateTime<Utc>) -> Result<(), StoreError> {
    if let Some(status) = patch.status {
        task.transition(status, now).map_err(|e| StoreError::Corrupt(e.message))?;
    }
    if let Some(priority) = patch.priority {
        task.priority = priority;
    }
    if let Some(retry_count) = patch.retry_count {
        task.retry_count = retry_count;
    }
    if let Some(error) = patch.error {
        task.error = error;
    }
    if let Some(result) = patch.result {
        task.result = result;
    }
    if let Some(completed_at) = patch.completed_at {
        task.completed_at = completed_at;
    }
    if let Some(moved_to_dlq_at) = patch.moved_to_dlq_at {
        task.moved_to_dlq_at = moved_to_dlq_at;
    }
    if let Some(heartbeat) = patch.heartbeat {
        task.heartbeat = heartbeat;
    }
    if let Some(eligible_at) = patch.eligible_at {
        task.eligible_at = eligible_at;
    }
    task.updated = now;
    Ok(())
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn save_task(&self, task: Task) -> Result<(), StoreError> {
        self.tasks.write().insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().get(&id).cloned())
    }

    async fn update_task(&self, id: TaskId, patch: TaskPatch) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        apply_patch(task, patch, Utc::now())
    }

    async fn get_pending(&self, limit: Option<usize>) -> Result<Vec<Task>, StoreError> {
        let now = Utc::now();
        let tasks = self.tasks.read();
        let mut pending: Vec<Task> = tasks
            .values()
            .filter(|t| is_claimable(t, now))
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created.cmp(&b.created))
        });
        if let Some(limit) = limit {
            pending.truncate(limit);
        }
        Ok(pending)
    }

    async fn get_in_progress(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .cloned()
            .collect())
    }

    async fn claim_one(&self) -> Result<Option<Task>, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();
        let candidate_id = {
            let mut candidates: Vec<&Task> = tasks.values().filter(|t| is_claimable(t, now)).collect();
            candidates.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.created.cmp(&b.created))
            });
            candidates.first().map(|t| t.id)
        };
        match candidate_id {
            Some(id) => {
                let task = tasks.get_mut(&id).unwrap();
                task.transition(TaskStatus::InProgress, now)
                    .map_err(|e| StoreError::Corrupt(e.message))?;
                Ok(Some(task.clone()))
            }
            None => Ok(None),
        }
    }

    async fn save_result(&self, task_id: TaskId, result: TaskResult) -> Result<(), StoreError> {
        self.results.write().insert(task_id, result);
        Ok(())
    }

    async fn get_result(&self, task_id: TaskId) -> Result<Option<TaskResult>, StoreError> {
        Ok(self.results.read().get(&task_id).cloned())
    }

    async fn append_metric(&self, sample: MetricSample) -> Result<(), StoreError> {
        self.metrics.write().push(sample);
        Ok(())
    }

    async fn query_metrics(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, StoreError> {
        Ok(self
            .metrics
            .read()
            .iter()
            .filter(|m| m.name == name && m.timestamp >= from && m.timestamp <= to)
            .cloned()
            .collect())
    }

    async fn try_advisory_lock(&self, lock_id: i64) -> Result<bool, StoreError> {
        Ok(self.advisory_locks.write().insert(lock_id))
    }

    async fn release_advisory_lock(&self, lock_id: i64) -> Result<(), StoreError> {
        self.advisory_locks.write().remove(&lock_id);
        Ok(())
    }

    async fn check_advisory_lock(&self, lock_id: i64) -> Result<bool, StoreError> {
        Ok(self.advisory_locks.read().contains(&lock_id))
    }

    async fn move_to_dlq(&self, mut task: Task, error_history: Vec<String>) -> Result<(), StoreError> {
        let now = Utc::now();
        task.transition(TaskStatus::DeadLetter, now)
            .map_err(|e| StoreError::Corrupt(e.message))?;
        let id = task.id;
        self.dlq.write().insert(id, DlqEntry { task: task.clone(), error_history });
        self.tasks.write().insert(id, task);
        Ok(())
    }

    async fn dlq_count(&self) -> Result<usize, StoreError> {
        Ok(self.dlq.read().len())
    }

    async fn get_dlq(&self, limit: Option<usize>) -> Result<Vec<DlqEntry>, StoreError> {
        let dlq = self.dlq.read();
        let mut entries: Vec<DlqEntry> = dlq.values().cloned().collect();
        entries.sort_by(|a, b| b.task.moved_to_dlq_at.cmp(&a.task.moved_to_dlq_at));
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn remove_from_dlq(&self, id: TaskId) -> Result<(), StoreError> {
        self.dlq.write().remove(&id);
        Ok(())
    }

    async fn cleanup_dlq(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut dlq = self.dlq.write();
        let before_count = dlq.len();
        dlq.retain(|_, entry| entry.task.moved_to_dlq_at.map(|t| t > before).unwrap_or(true));
        Ok(before_count - dlq.len())
    }

    async fn cleanup(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tasks = self.tasks.write();
        let before_count = tasks.len();
        tasks.retain(|_, t| {
            let terminal = matches!(t.status, TaskStatus::Completed | TaskStatus::Failed);
            !(terminal && t.updated < before)
        });
        Ok(before_count - tasks.len())
    }

    async fn healthy(&self) -> Result<HealthStatus, StoreError> {
        Ok(HealthStatus {
            latency: StdDuration::from_micros(1),
            ok: true,
        })
    }
}
