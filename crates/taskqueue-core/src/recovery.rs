//! Retry policy application (§4.7) and the RecoveryManager loop that detects
//! crashed or stuck in-progress tasks and re-applies that same policy (§4.8).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::dlq::{DeadLetterQueue, DlqError};
use crate::error::strategy_for;
use crate::reliability::{CircuitBreaker, CircuitBreakerConfig};
use crate::storage::{Storage, StoreError};
use crate::task::{Task, TaskError, TaskId, TaskPatch, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("dlq error: {0}")]
    Dlq(#[from] DlqError),
}

/// Outcome of applying the retry policy, exposed for callers (metrics,
/// tests) that want to know which branch was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Requeued,
    Failed,
    DeadLettered,
}

/// Apply the §4.7 retry policy to a task that just failed with `error`.
/// Shared by `Scheduler::fail` and `RecoveryManager`'s stuck-task recovery.
#[tracing::instrument(skip(storage, dlq, task, error), fields(task_id = %task.id))]
pub async fn apply_retry_policy(
    storage: &dyn Storage,
    dlq: &DeadLetterQueue,
    global_max_retries: u32,
    mut task: Task,
    error: TaskError,
) -> Result<RetryOutcome, RecoveryError> {
    let now = Utc::now();
    task.retry_count += 1;

    let strategy = strategy_for(error.code);
    let retry_ceiling = strategy.max_retries.min(global_max_retries);

    if let Some(cleanup) = &strategy.cleanup {
        if let Err(e) = cleanup(&task) {
            tracing::warn!(task_id = %task.id, error = %e, "retry cleanup hook failed, ignoring");
        }
    }

    if !strategy.retryable || task.retry_count >= retry_ceiling {
        if error.code.terminal_for_dlq() {
            let task_id = task.id;
            task.transition(TaskStatus::DeadLetter, now)?;
            dlq.admit(task, vec![error.message.clone()]).await?;
            tracing::error!(task_id = %task_id, "task_dead_lettered");
            return Ok(RetryOutcome::DeadLettered);
        }

        task.transition(TaskStatus::Failed, now)?;
        storage
            .update_task(
                task.id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    retry_count: Some(task.retry_count),
                    error: Some(Some(error)),
                    ..Default::default()
                },
            )
            .await?;
        tracing::warn!(task_id = %task.id, "task_failed");
        return Ok(RetryOutcome::Failed);
    }

    let backoff_ms = strategy.backoff_ms * 2u64.saturating_pow(task.retry_count.saturating_sub(1));
    let eligible_at = now + chrono::Duration::milliseconds(backoff_ms as i64);
    let bumped_priority = task.priority.bumped();

    task.transition(TaskStatus::Pending, now)?;
    storage
        .update_task(
            task.id,
            TaskPatch {
                status: Some(TaskStatus::Pending),
                priority: Some(bumped_priority),
                retry_count: Some(task.retry_count),
                error: Some(Some(error)),
                eligible_at: Some(eligible_at),
                ..Default::default()
            },
        )
        .await?;
    tracing::warn!(task_id = %task.id, backoff_ms, "task_requeued");
    Ok(RetryOutcome::Requeued)
}

impl From<TaskError> for RecoveryError {
    fn from(err: TaskError) -> Self {
        RecoveryError::Store(StoreError::Corrupt(err.message))
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub interval: Duration,
    pub task_timeout: Duration,
    pub max_concurrent_recoveries: usize,
    pub global_max_retries: u32,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            task_timeout: Duration::from_secs(30),
            max_concurrent_recoveries: 10,
            global_max_retries: 3,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Periodic scan for in-progress tasks whose heartbeat/update has gone
/// stale, applying the retry policy with a synthetic timeout error (§4.8).
pub struct RecoveryManager {
    storage: Arc<dyn Storage>,
    dlq: Arc<DeadLetterQueue>,
    config: RecoveryConfig,
    breaker: CircuitBreaker,
}

impl RecoveryManager {
    pub fn new(storage: Arc<dyn Storage>, dlq: Arc<DeadLetterQueue>, config: RecoveryConfig) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone());
        Self {
            storage,
            dlq,
            config,
            breaker,
        }
    }

    /// Run one scan-and-recover pass. Returns the ids recovered.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&self) -> Result<Vec<TaskId>, RecoveryError> {
        if self.breaker.allow().is_err() {
            tracing::warn!("recovery circuit breaker open, skipping tick");
            return Ok(Vec::new());
        }

        let in_progress = match self.storage.get_in_progress().await {
            Ok(tasks) => {
                self.breaker.record_success();
                tasks
            }
            Err(e) => {
                self.breaker.record_failure();
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let mut recovered = Vec::new();

        for task in in_progress {
            let last_seen = task.heartbeat.unwrap_or(task.updated);
            let staleness = now - last_seen;
            let timeout = chrono::Duration::from_std(self.config.task_timeout).unwrap_or_default();

            if staleness > timeout {
                let error = TaskError::timeout(format!(
                    "task {} stale by {}ms",
                    task.id,
                    staleness.num_milliseconds()
                ));
                let task_id = task.id;
                match apply_retry_policy(
                    self.storage.as_ref(),
                    self.dlq.as_ref(),
                    self.config.global_max_retries,
                    task,
                    error,
                )
                .await
                {
                    Ok(_) => {
                        recovered.push(task_id);
                        tracing::warn!(task_id = %task_id, "task_recovered");
                    }
                    Err(e) => tracing::error!(task_id = %task_id, error = %e, "recovery failed"),
                }
                if recovered.len() >= self.config.max_concurrent_recoveries {
                    break;
                }
            } else if staleness > timeout / 2 {
                tracing::warn!(task_id = %task.id, "queue_health_warning: task staleness approaching timeout");
            }
        }

        Ok(recovered)
    }

    /// Spawn the periodic recovery loop, stopping when `shutdown` fires.
    pub fn spawn(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            tracing::error!(error = %e, "recovery tick failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!("recovery loop shutting down");
                        break;
                    }
                }
            }
        })
    }
}
