//! Storage: the durable persistence contract (§4.1).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::task::{MetricSample, Task, TaskId, TaskPatch, TaskResult};

pub use memory::InMemoryStorage;
pub use postgres::PostgresStorage;

/// Storage errors, split into transient (retryable by the caller) and
/// terminal kinds, per §4.1's failure semantics.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("temporary storage error: {0}")]
    Temporary(String),

    #[error("corrupt storage state: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Whether a caller should retry this operation (§7 propagation policy).
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Temporary(_) | StoreError::Database(_))
    }
}

/// Health check result: round-trip latency plus an ok flag.
#[derive(Debug, Clone, Copy)]
pub struct HealthStatus {
    pub latency: std::time::Duration,
    pub ok: bool,
}

/// The narrow CRUD + query + advisory-lock + DLQ interface every backing
/// store implements (§4.1). Both the PostgreSQL-backed store and the
/// in-memory test store satisfy this same contract so scheduler/recovery/dlq
/// logic is store-agnostic.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert or overwrite a task. Atomic per task.
    async fn save_task(&self, task: Task) -> Result<(), StoreError>;

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Conditional partial update; merges the patch and refreshes `updated`.
    async fn update_task(&self, id: TaskId, patch: TaskPatch) -> Result<(), StoreError>;

    /// Pending tasks whose `eligible_at <= now`, ordered by (priority desc, created asc).
    /// Never returns DLQ entries.
    async fn get_pending(&self, limit: Option<usize>) -> Result<Vec<Task>, StoreError>;

    /// In-progress tasks, for the recovery loop.
    async fn get_in_progress(&self) -> Result<Vec<Task>, StoreError>;

    /// Atomically claim the next pending, eligible task and mark it in_progress.
    /// Implemented via `SELECT ... FOR UPDATE SKIP LOCKED` so concurrent
    /// schedulers never claim the same row.
    async fn claim_one(&self) -> Result<Option<Task>, StoreError>;

    async fn save_result(&self, task_id: TaskId, result: TaskResult) -> Result<(), StoreError>;
    async fn get_result(&self, task_id: TaskId) -> Result<Option<TaskResult>, StoreError>;

    async fn append_metric(&self, sample: MetricSample) -> Result<(), StoreError>;
    async fn query_metrics(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, StoreError>;

    /// Connection-scoped advisory lock primitive (§4.2, §6).
    async fn try_advisory_lock(&self, lock_id: i64) -> Result<bool, StoreError>;
    async fn release_advisory_lock(&self, lock_id: i64) -> Result<(), StoreError>;
    async fn check_advisory_lock(&self, lock_id: i64) -> Result<bool, StoreError>;

    /// Move a task (already failed terminally) into the DLQ partition.
    async fn move_to_dlq(&self, task: Task, error_history: Vec<String>) -> Result<(), StoreError>;
    async fn dlq_count(&self) -> Result<usize, StoreError>;
    async fn get_dlq(&self, limit: Option<usize>) -> Result<Vec<crate::task::DlqEntry>, StoreError>;
    async fn remove_from_dlq(&self, id: TaskId) -> Result<(), StoreError>;
    async fn cleanup_dlq(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Purge completed/failed tasks and their results older than `before`.
    async fn cleanup(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn healthy(&self) -> Result<HealthStatus, StoreError>;
}

/// Helper shared by both implementations: does this task belong to the live
/// (non-DLQ) pending view?
pub(crate) fn is_claimable(task: &Task, now: DateTime<Utc>) -> bool {
    task.status == crate::task::TaskStatus::Pending && task.eligible_at <= now
}
