//! Orchestrator: the crate's single composition root (§4.11). Wires
//! Storage, LockManager, AdmissionController, Scheduler, WorkerPool,
//! RecoveryManager, DeadLetterQueue, and MetricsCollector together and
//! drives the five-step shutdown sequence from §5.

use std::sync::Arc;

use crate::admission::{AdmissionController, AdmissionLimits};
use crate::config::QueueConfig;
use crate::dlq::{DeadLetterQueue, DlqConfig};
use crate::lock::LockManager;
use crate::metrics::{MetricsCollector, MetricsConfig};
use crate::recovery::{RecoveryConfig, RecoveryManager};
use crate::reliability::CircuitBreakerConfig;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::storage::{Storage, StoreError};
use crate::worker::{Executor, WorkerPool, WorkerPoolConfig};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("orchestrator already started")]
    AlreadyStarted,
    #[error("worker pool shutdown: {0}")]
    Worker(#[from] crate::worker::WorkerPoolError),
}

struct Handles {
    scheduler_poll: tokio::task::JoinHandle<()>,
    recovery: tokio::task::JoinHandle<()>,
    recovery_shutdown: tokio::sync::watch::Sender<bool>,
    autoscaler: tokio::task::JoinHandle<()>,
}

/// Owns every long-lived component and its lifecycle. A host binary needs
/// only `Orchestrator::new(config, storage, executor).start().await`.
pub struct Orchestrator {
    config: QueueConfig,
    storage: Arc<dyn Storage>,
    lock_manager: Arc<LockManager>,
    admission: Arc<AdmissionController>,
    worker_pool: Arc<WorkerPool>,
    dlq: Arc<DeadLetterQueue>,
    metrics: Arc<MetricsCollector>,
    scheduler: Arc<Scheduler>,
    recovery: Arc<RecoveryManager>,
    handles: parking_lot::Mutex<Option<Handles>>,
}

impl Orchestrator {
    pub fn new(config: QueueConfig, storage: Arc<dyn Storage>, executor: Arc<dyn Executor>) -> Self {
        let lock_manager = Arc::new(LockManager::new(storage.clone()));

        let admission = Arc::new(AdmissionController::new(AdmissionLimits {
            max_concurrent_total: config.max_concurrent_total,
            max_concurrent_per_type: config.max_concurrent_per_type.clone(),
            rate_window: config.rate_window,
            rate_max_requests: config.rate_max_requests,
        }));

        let worker_pool = Arc::new(WorkerPool::new(
            executor,
            WorkerPoolConfig {
                worker_min: config.worker_min,
                worker_max: config.worker_max,
                scale_check_interval: config.worker_scale_check_interval,
                high_watermark: config.worker_high_watermark,
                low_watermark: config.worker_low_watermark,
                shutdown_grace_period: config.shutdown_grace_period,
            },
        ));

        let dlq = Arc::new(DeadLetterQueue::new(
            storage.clone(),
            DlqConfig {
                max_dlq_size: config.max_dlq_size,
                alert_threshold: config.dlq_alert_threshold,
                retry_limit: config.dlq_retry_limit,
            },
        ));

        let metrics = Arc::new(MetricsCollector::new(MetricsConfig {
            window: config.metrics_window,
            cleanup_interval: config.metrics_cleanup_interval,
            ..Default::default()
        }));

        let scheduler = Arc::new(Scheduler::new(
            storage.clone(),
            lock_manager.clone(),
            admission.clone(),
            worker_pool.clone(),
            dlq.clone(),
            SchedulerConfig {
                poll_interval: config.poll_interval,
                poll_backoff_ceiling: config.poll_backoff_ceiling,
                batch_size: config.max_concurrent_total,
                task_timeout: config.task_timeout,
                max_concurrent_total: config.max_concurrent_total,
                global_max_retries: config.max_retries,
            },
        ));

        let recovery = Arc::new(RecoveryManager::new(
            storage.clone(),
            dlq.clone(),
            RecoveryConfig {
                interval: config.recovery_interval,
                task_timeout: config.task_timeout,
                max_concurrent_recoveries: config.max_concurrent_recoveries,
                global_max_retries: config.max_retries,
                circuit_breaker: CircuitBreakerConfig::default(),
            },
        ));

        Self {
            config,
            storage,
            lock_manager,
            admission,
            worker_pool,
            dlq,
            metrics,
            scheduler,
            recovery,
            handles: parking_lot::Mutex::new(None),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Spawn the scheduler poll loop, the recovery loop, and the worker
    /// pool autoscaler.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        if self.handles.lock().is_some() {
            return Err(OrchestratorError::AlreadyStarted);
        }

        tracing::info!("starting orchestrator");

        let scheduler_poll = self.scheduler.clone().spawn();
        let (recovery_tx, recovery_rx) = tokio::sync::watch::channel(false);
        let recovery = self.recovery.clone().spawn(recovery_rx);

        let storage = self.storage.clone();
        let autoscaler = self.worker_pool.clone().spawn_autoscaler(move || {
            // Best-effort backlog estimate; a blocking call here would stall
            // the autoscaler tick, so this purposely tolerates staleness.
            let storage = storage.clone();
            futures::executor::block_on(async move {
                storage.get_pending(None).await.map(|t| t.len()).unwrap_or(0)
            })
        });

        *self.handles.lock() = Some(Handles {
            scheduler_poll,
            recovery,
            recovery_shutdown: recovery_tx,
            autoscaler,
        });

        Ok(())
    }

    /// Five-step shutdown (§5): stop scheduler polling, drain workers within
    /// the grace period, stop the recovery loop, release all locks, close
    /// storage handles are left to `Drop` on the storage handle itself.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        tracing::info!("stopping orchestrator");

        self.scheduler.stop();

        self.worker_pool.shutdown().await?;

        if let Some(handles) = self.handles.lock().take() {
            let _ = handles.recovery_shutdown.send(true);
            handles.scheduler_poll.abort();
            handles.recovery.abort();
            handles.autoscaler.abort();
        }

        self.lock_manager.release_all().await.ok();

        tracing::info!("orchestrator stopped");
        Ok(())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}
