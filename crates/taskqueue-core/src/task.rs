//! The task data model: the tagged-union record at the center of the queue (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique, time-ordered task identifier.
pub type TaskId = Uuid;

/// Generate a fresh, time-ordered task id.
pub fn new_task_id() -> TaskId {
    Uuid::now_v7()
}

/// The five operation kinds a task may carry. Kind-specific payload is opaque
/// to the core and passed verbatim to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Search,
    Read,
    Write,
    Update,
    Delete,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Search => "search",
            TaskKind::Read => "read",
            TaskKind::Write => "write",
            TaskKind::Update => "update",
            TaskKind::Delete => "delete",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = InvalidTaskKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "search" => Ok(TaskKind::Search),
            "read" => Ok(TaskKind::Read),
            "write" => Ok(TaskKind::Write),
            "update" => Ok(TaskKind::Update),
            "delete" => Ok(TaskKind::Delete),
            other => Err(InvalidTaskKind(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid task kind: {0}")]
pub struct InvalidTaskKind(String);

/// Ordered priority level. Ordering is declaration order: Low < Normal < High < Urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// `base` component of the priority score (§4.3): 0..3.
    pub fn base_score(&self) -> f64 {
        match self {
            Priority::Low => 0.0,
            Priority::Normal => 1.0,
            Priority::High => 2.0,
            Priority::Urgent => 3.0,
        }
    }

    /// One level up, capped at Urgent. Used to bias retries ahead of cold work (§4.7).
    pub fn bumped(&self) -> Priority {
        match self {
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::High,
            Priority::High | Priority::Urgent => Priority::Urgent,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Status. Transitions are restricted to the closure documented in §3:
/// pending -> in_progress -> {completed, pending (retry), failed, dead_letter};
/// dead_letter -> pending (manual retry only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    DeadLetter,
}

impl TaskStatus {
    /// Whether `self -> next` is one of the transitions enumerated in §3.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Pending)
                | (InProgress, Failed)
                | (InProgress, DeadLetter)
                | (DeadLetter, Pending)
        )
    }
}

/// Severity of a task error, independent of whether it is retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Critical,
}

/// The error taxonomy kinds from §7. Not exhaustive of every application error,
/// but every error the core itself reasons about (retry policy, DLQ routing)
/// is classified into one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    InvalidInput,
    NotFound,
    RateLimited,
    ServiceUnavailable,
    Internal,
    Network,
    Validation,
    TaskExecutionFailed,
    TaskTimeout,
    TaskCancelled,
    TaskValidationFailed,
    TaskDependencyFailed,
    Configuration,
    ResourceExhausted,
    ConcurrentRequestsExceeded,
    NetworkUnavailable,
    ConnectionReset,
    Timeout,
}

impl ErrorCode {
    /// Terminal-for-DLQ errors (§4.7 step 4): when retries are exhausted,
    /// these route to the dead letter queue rather than a plain `failed` status.
    pub fn terminal_for_dlq(&self) -> bool {
        matches!(
            self,
            ErrorCode::TaskExecutionFailed | ErrorCode::TaskDependencyFailed | ErrorCode::Timeout
        )
    }
}

/// The error payload attached to a task's last failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl TaskError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            severity: ErrorSeverity::Warning,
            recoverable: true,
            metadata: None,
        }
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Synthetic error used by the WorkerPool's per-task deadline race and by RecoveryManager.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TaskTimeout, message).with_severity(ErrorSeverity::Critical)
    }
}

/// Lets host `Executor` implementations return `anyhow::Error` directly
/// from their fallible internals via `?`, without hand-rolling a `TaskError`
/// at every call site.
impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::new(ErrorCode::TaskExecutionFailed, err.to_string())
    }
}

/// The task record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved_to_dlq_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<DateTime<Utc>>,
    /// The opaque, kind-specific payload. Never introspected by the core.
    pub payload: serde_json::Value,
    /// The "earliest eligible at" timestamp `get_pending` honours (§4.7 step 5).
    /// Defaults to `created` so a freshly enqueued task is immediately eligible.
    pub eligible_at: DateTime<Utc>,
}

impl Task {
    pub fn new(kind: TaskKind, priority: Priority, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: new_task_id(),
            kind,
            status: TaskStatus::Pending,
            priority,
            weight: None,
            deadline: None,
            created: now,
            updated: now,
            completed_at: None,
            retry_count: 0,
            error: None,
            result: None,
            dependencies: Vec::new(),
            moved_to_dlq_at: None,
            heartbeat: None,
            payload,
            eligible_at: now,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight.clamp(0.0, 1.0));
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Attempt a status transition, validating against the closure in §3.
    /// Always advances `updated`; sets/clears `completed_at`/`moved_to_dlq_at`
    /// exactly when required.
    pub fn transition(&mut self, next: TaskStatus, now: DateTime<Utc>) -> Result<(), TaskError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskError::new(
                ErrorCode::Internal,
                format!("illegal transition {:?} -> {:?}", self.status, next),
            )
            .with_recoverable(false));
        }
        self.status = next;
        self.updated = now;
        match next {
            TaskStatus::Completed => self.completed_at = Some(now),
            TaskStatus::DeadLetter => self.moved_to_dlq_at = Some(now),
            TaskStatus::Pending => {
                // Manual retry from DLQ, or requeue after failure: clear terminal markers.
                self.completed_at = None;
                self.moved_to_dlq_at = None;
            }
            _ => {}
        }
        Ok(())
    }
}

/// A patch applied via `Storage::update_task`. All fields optional; unset
/// fields are left untouched. `updated` is always refreshed by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub retry_count: Option<u32>,
    pub error: Option<Option<TaskError>>,
    pub result: Option<Option<serde_json::Value>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub moved_to_dlq_at: Option<Option<DateTime<Utc>>>,
    pub heartbeat: Option<Option<DateTime<Utc>>>,
    pub eligible_at: Option<DateTime<Utc>>,
}

/// A result row keyed by task id. Opaque payload, one per completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub created: DateTime<Utc>,
}

/// A metric sample (§3): append-only, time-bounded retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// A DLQ entry: a task in status dead_letter plus its accumulated error history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub task: Task,
    pub error_history: Vec<String>,
}
