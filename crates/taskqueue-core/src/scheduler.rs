//! Scheduler: the poll/dispatch loop gating tasks through the lock manager
//! and admission controller before handing them to the worker pool (§4.5).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::admission::AdmissionController;
use crate::dlq::DeadLetterQueue;
use crate::lock::{task_lock_key, LockManager};
use crate::priority;
use crate::recovery::apply_retry_policy;
use crate::storage::{Storage, StoreError};
use crate::task::{TaskError, TaskId, TaskPatch, TaskStatus};
use crate::worker::WorkerPool;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub poll_backoff_ceiling: Duration,
    pub batch_size: usize,
    pub task_timeout: Duration,
    pub max_concurrent_total: usize,
    pub global_max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            poll_backoff_ceiling: Duration::from_secs(10),
            batch_size: 50,
            task_timeout: Duration::from_secs(30),
            max_concurrent_total: 50,
            global_max_retries: 3,
        }
    }
}

/// Drives the claim -> dispatch -> complete/fail cycle. Holds no row-level
/// state of its own; everything that must survive a crash lives in Storage.
pub struct Scheduler {
    storage: Arc<dyn Storage>,
    lock_manager: Arc<LockManager>,
    admission: Arc<AdmissionController>,
    worker_pool: Arc<WorkerPool>,
    dlq: Arc<DeadLetterQueue>,
    config: SchedulerConfig,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        storage: Arc<dyn Storage>,
        lock_manager: Arc<LockManager>,
        admission: Arc<AdmissionController>,
        worker_pool: Arc<WorkerPool>,
        dlq: Arc<DeadLetterQueue>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        Self {
            storage,
            lock_manager,
            admission,
            worker_pool,
            dlq,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// One claim/dispatch pass. Returns the number of tasks dispatched, used
    /// by the poll loop to drive adaptive backoff.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(self: &Arc<Self>) -> Result<usize, SchedulerError> {
        if self.worker_pool.active_tasks() >= self.config.max_concurrent_total {
            return Ok(0);
        }

        let batch = self.config.batch_size.max(self.config.max_concurrent_total);
        let mut tasks = self.storage.get_pending(Some(batch)).await?;
        priority::sort(&mut tasks, Utc::now());

        let mut dispatched = 0;
        for task in tasks {
            if dispatched >= self.config.max_concurrent_total {
                break;
            }

            let key = task_lock_key(task.id);
            match self.lock_manager.acquire(&key).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "lock acquire failed");
                    continue;
                }
            }

            if !self.admission.acquire(&task) {
                let _ = self.lock_manager.release(&key).await;
                continue;
            }

            let task_id = task.id;
            if let Err(e) = self
                .storage
                .update_task(task_id, TaskPatch { status: Some(TaskStatus::InProgress), ..Default::default() })
                .await
            {
                tracing::error!(task_id = %task_id, error = %e, "failed to mark task in_progress");
                self.admission.release(task_id);
                let _ = self.lock_manager.release(&key).await;
                continue;
            }

            tracing::info!(task_id = %task_id, "task_started");
            self.dispatch(task).await;
            dispatched += 1;
        }

        Ok(dispatched)
    }

    async fn dispatch(self: &Arc<Self>, task: crate::task::Task) {
        let id = task.id;
        let scheduler_for_complete = Arc::clone(self);
        let dispatched = self.worker_pool.try_dispatch(task, self.config.task_timeout, move |result| {
            tokio::spawn(async move {
                match result {
                    Ok(value) => scheduler_for_complete.complete(id, value).await,
                    Err(error) => scheduler_for_complete.fail(id, error).await,
                }
            });
        });

        if !dispatched {
            tracing::warn!(task_id = %id, "worker pool saturated despite admission check");
            self.admission.release(id);
            let _ = self.lock_manager.release(&task_lock_key(id)).await;
        }
    }

    /// Completion API (§4.5): writes the result, releases admission and the
    /// lock, and records the lifecycle event.
    #[tracing::instrument(skip(self, result))]
    pub async fn complete(&self, id: TaskId, result: serde_json::Value) {
        let now = Utc::now();
        if let Err(e) = self
            .storage
            .update_task(
                id,
                TaskPatch {
                    status: Some(TaskStatus::Completed),
                    result: Some(Some(result)),
                    completed_at: Some(Some(now)),
                    ..Default::default()
                },
            )
            .await
        {
            tracing::error!(task_id = %id, error = %e, "failed to persist completion");
        } else {
            tracing::info!(task_id = %id, "task_completed");
        }
        self.admission.release(id);
        let _ = self.lock_manager.release(&task_lock_key(id)).await;
    }

    /// Failure API (§4.5): applies the retry policy in one pass, then
    /// releases admission and the lock regardless of outcome.
    #[tracing::instrument(skip(self, error))]
    pub async fn fail(&self, id: TaskId, error: TaskError) {
        match self.storage.get_task(id).await {
            Ok(Some(task)) => {
                if let Err(e) =
                    apply_retry_policy(self.storage.as_ref(), self.dlq.as_ref(), self.config.global_max_retries, task, error).await
                {
                    tracing::error!(task_id = %id, error = %e, "retry policy application failed");
                }
            }
            Ok(None) => tracing::error!(task_id = %id, "task vanished before fail() could run"),
            Err(e) => tracing::error!(task_id = %id, error = %e, "failed to load task for fail()"),
        }
        self.admission.release(id);
        let _ = self.lock_manager.release(&task_lock_key(id)).await;
    }

    /// Spawn the poll loop with adaptive backoff: doubles the interval
    /// (capped at `poll_backoff_ceiling`) on empty polls, resets immediately
    /// on any successful dispatch.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = self.config.poll_interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("scheduler poll loop shutting down");
                        break;
                    }
                }

                match self.run_once().await {
                    Ok(0) => {
                        interval = (interval * 2).min(self.config.poll_backoff_ceiling);
                    }
                    Ok(_) => {
                        interval = self.config.poll_interval;
                    }
                    Err(e) => tracing::error!(error = %e, "scheduler poll failed"),
                }
            }
        })
    }

    /// Stop the poll loop (no new dispatches). Does not wait for in-flight
    /// work; that is the WorkerPool's `shutdown` responsibility.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionLimits;
    use crate::dlq::DlqConfig;
    use crate::storage::InMemoryStorage;
    use crate::task::{Priority, Task, TaskKind};
    use crate::worker::WorkerPoolConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn build_scheduler(max_concurrent_total: usize) -> (Arc<Scheduler>, Arc<InMemoryStorage>, Arc<AtomicUsize>) {
        let storage = Arc::new(InMemoryStorage::new());
        let lock_manager = Arc::new(LockManager::new(storage.clone()));
        let admission = Arc::new(AdmissionController::new(AdmissionLimits {
            max_concurrent_total,
            ..Default::default()
        }));
        let completed = Arc::new(AtomicUsize::new(0));
        let completed_for_executor = completed.clone();
        let executor: Arc<dyn crate::worker::Executor> = Arc::new(move |task: Task| {
            let completed = completed_for_executor.clone();
            async move {
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(task.payload)
            }
        });
        let pool = Arc::new(WorkerPool::new(executor, WorkerPoolConfig { worker_min: 4, ..Default::default() }));
        let dlq = Arc::new(DeadLetterQueue::new(storage.clone(), DlqConfig::default()));
        let scheduler = Arc::new(Scheduler::new(
            storage.clone(),
            lock_manager,
            admission,
            pool,
            dlq,
            SchedulerConfig { max_concurrent_total, ..Default::default() },
        ));
        (scheduler, storage, completed)
    }

    #[tokio::test]
    async fn run_once_dispatches_pending_tasks_and_marks_in_progress() {
        let (scheduler, storage, completed) = build_scheduler(10);
        let task = Task::new(TaskKind::Search, Priority::Normal, serde_json::json!({"v": 1}));
        let id = task.id;
        storage.save_task(task).await.unwrap();

        let dispatched = scheduler.run_once().await.unwrap();
        assert_eq!(dispatched, 1);

        for _ in 0..50 {
            if completed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        for _ in 0..50 {
            let task = storage.get_task(id).await.unwrap().unwrap();
            if task.status == TaskStatus::Completed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task never reached completed status");
    }

    #[tokio::test]
    async fn run_once_respects_max_concurrent_total() {
        let (scheduler, storage, _completed) = build_scheduler(1);
        for i in 0..3 {
            storage
                .save_task(Task::new(TaskKind::Search, Priority::Normal, serde_json::json!({"i": i})))
                .await
                .unwrap();
        }
        let dispatched = scheduler.run_once().await.unwrap();
        assert_eq!(dispatched, 1);
    }
}
