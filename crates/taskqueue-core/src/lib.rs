//! # Task Queue Core
//!
//! A PostgreSQL-backed distributed task queue for reliable, concurrent
//! execution of search/read/write/update/delete work items.
//!
//! ## Features
//!
//! - **Exclusive claiming**: `FOR UPDATE SKIP LOCKED` plus connection-scoped
//!   advisory locks, so no two workers ever run the same task at once
//! - **Priority scheduling**: age-weighted scoring keeps low-priority tasks
//!   from starving under sustained load
//! - **Admission control**: per-type concurrency caps and sliding-window
//!   rate limiting, independent of the database
//! - **Autoscaling worker pool**: semaphore-gated dispatch with graceful,
//!   drain-on-shutdown semantics
//! - **Crash recovery**: a circuit-breaker-guarded loop that detects stuck
//!   in-progress tasks and re-applies the retry policy
//! - **Dead letter queue**: bounded admission, manual retry, retention cleanup
//! - **Rolling metrics**: per-task and queue-wide snapshots with alert rules
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Orchestrator                          │
//! │  (composition root: wires everything below, owns shutdown)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼────────────────────┐
//!          ▼                   ▼                     ▼
//! ┌────────────────┐  ┌────────────────┐   ┌──────────────────┐
//! │   Scheduler     │  │ RecoveryManager│   │ DeadLetterQueue  │
//! │ (poll + dispatch)│ │ (stale tasks)  │   │ (retry/cleanup)  │
//! └────────────────┘  └────────────────┘   └──────────────────┘
//!          │                   │                     │
//!          ▼                   ▼                     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              LockManager + AdmissionController                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Storage                              │
//! │      (PostgreSQL: tasks, task_results, metrics tables)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use taskqueue_core::prelude::*;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(PostgresStorage::connect("postgres://...").await?);
//! let executor: Arc<dyn Executor> = Arc::new(|task| async move {
//!     Ok(serde_json::json!({ "processed": task.id }))
//! });
//!
//! let orchestrator = Orchestrator::new(QueueConfig::from_env(), storage, executor);
//! orchestrator.start().await?;
//! ```

pub mod admission;
pub mod bench;
pub mod config;
pub mod dlq;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod orchestrator;
pub mod priority;
pub mod recovery;
pub mod reliability;
pub mod scheduler;
pub mod storage;
pub mod task;
pub mod worker;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::admission::{AdmissionController, AdmissionError, AdmissionLimits};
    pub use crate::config::QueueConfig;
    pub use crate::dlq::{DeadLetterQueue, DlqConfig, DlqError};
    pub use crate::error::{strategy_for, RecoveryStrategy};
    pub use crate::lock::{LockError, LockManager};
    pub use crate::metrics::{AlertKind, MetricsCollector, MetricsConfig, PerTaskMetrics, QueueSnapshot};
    pub use crate::orchestrator::{Orchestrator, OrchestratorError};
    pub use crate::recovery::{RecoveryConfig, RecoveryManager};
    pub use crate::reliability::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
    pub use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerError};
    pub use crate::storage::{HealthStatus, InMemoryStorage, PostgresStorage, Storage, StoreError};
    pub use crate::task::{
        ErrorCode, ErrorSeverity, Priority, Task, TaskError, TaskId, TaskKind, TaskPatch, TaskResult,
        TaskStatus,
    };
    pub use crate::worker::{Executor, ExecutorResult, WorkerPool, WorkerPoolConfig, WorkerPoolError};
}

pub use admission::{AdmissionController, AdmissionLimits};
pub use config::QueueConfig;
pub use dlq::DeadLetterQueue;
pub use lock::LockManager;
pub use metrics::MetricsCollector;
pub use orchestrator::Orchestrator;
pub use recovery::RecoveryManager;
pub use reliability::{CircuitBreaker, CircuitBreakerConfig};
pub use scheduler::Scheduler;
pub use storage::{InMemoryStorage, PostgresStorage, Storage, StoreError};
pub use task::{Task, TaskError, TaskId, TaskKind, TaskStatus};
pub use worker::{Executor, WorkerPool, WorkerPoolConfig};
