//! MetricsCollector: per-task and queue-wide rolling metrics plus alert
//! rules evaluated from snapshot deltas (§4.10).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::task::{Priority, TaskId, TaskStatus};

#[derive(Debug, Clone)]
pub struct PerTaskMetrics {
    pub queue_time: Option<Duration>,
    pub execution_time: Option<Duration>,
    pub retry_count: u32,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// A queue-wide snapshot, taken each time `snapshot` is called.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub timestamp: DateTime<Utc>,
    pub queue_size: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub avg_queue_time: Duration,
    pub avg_exec_time: Duration,
    pub throughput_per_min: f64,
    pub error_rate: f64,
    pub priority_distribution: HashMap<Priority, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    QueueGrowth,
    HighErrorRate,
    SlowExecution,
}

#[derive(Debug, Clone)]
pub struct AlertThresholds {
    pub queue_growth_ratio: f64,
    pub high_error_rate_ratio: f64,
    pub slow_execution: Duration,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            queue_growth_ratio: 3.0,
            high_error_rate_ratio: 0.1,
            slow_execution: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub window: Duration,
    pub cleanup_interval: Duration,
    pub alert_thresholds: AlertThresholds,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

/// Process-local metrics store. Fire-and-forget: recording never blocks the
/// hot path (plain map inserts behind lock-free/short-lock structures).
pub struct MetricsCollector {
    config: MetricsConfig,
    per_task: DashMap<TaskId, PerTaskMetrics>,
    snapshots: RwLock<Vec<QueueSnapshot>>,
    completed_total: std::sync::atomic::AtomicU64,
    failed_total: std::sync::atomic::AtomicU64,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            per_task: DashMap::new(),
            snapshots: RwLock::new(Vec::new()),
            completed_total: std::sync::atomic::AtomicU64::new(0),
            failed_total: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn record_task(&self, task_id: TaskId, metrics: PerTaskMetrics) {
        match metrics.status {
            TaskStatus::Completed => {
                self.completed_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            TaskStatus::Failed | TaskStatus::DeadLetter => {
                self.failed_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
            _ => {}
        }
        self.per_task.insert(task_id, metrics);
    }

    /// Take a snapshot of current queue state. Callers supply the live
    /// counts (from Storage/AdmissionController) since those are the
    /// sources of truth; this function only aggregates and stores.
    pub fn snapshot(
        &self,
        queue_size: usize,
        active: usize,
        priority_distribution: HashMap<Priority, usize>,
    ) -> QueueSnapshot {
        let now = Utc::now();
        let window_start = now - chrono::Duration::from_std(self.config.window).unwrap_or_default();

        let recent: Vec<_> = self
            .per_task
            .iter()
            .filter(|entry| entry.recorded_at >= window_start)
            .map(|entry| entry.value().clone())
            .collect();

        let completed_recent = recent.iter().filter(|m| m.status == TaskStatus::Completed).count();
        let failed_recent = recent
            .iter()
            .filter(|m| matches!(m.status, TaskStatus::Failed | TaskStatus::DeadLetter))
            .count();

        let avg_queue_time = average(recent.iter().filter_map(|m| m.queue_time));
        let avg_exec_time = average(recent.iter().filter_map(|m| m.execution_time));

        let window_minutes = (self.config.window.as_secs_f64() / 60.0).max(1.0 / 60.0);
        let throughput_per_min = completed_recent as f64 / window_minutes;
        let error_rate = if completed_recent + failed_recent > 0 {
            failed_recent as f64 / (completed_recent + failed_recent) as f64
        } else {
            0.0
        };

        let snapshot = QueueSnapshot {
            timestamp: now,
            queue_size,
            active,
            completed: self.completed_total.load(std::sync::atomic::Ordering::Relaxed),
            failed: self.failed_total.load(std::sync::atomic::Ordering::Relaxed),
            avg_queue_time,
            avg_exec_time,
            throughput_per_min,
            error_rate,
            priority_distribution,
        };

        self.snapshots.write().push(snapshot.clone());
        snapshot
    }

    /// Evaluate the default alert rules (§4.10) against the latest snapshot.
    pub fn check_alerts(&self, snapshot: &QueueSnapshot) -> Vec<AlertKind> {
        let t = &self.config.alert_thresholds;
        let mut fired = Vec::new();

        if snapshot.queue_size as f64 > t.queue_growth_ratio * snapshot.active as f64 {
            fired.push(AlertKind::QueueGrowth);
        }
        let errors_per_min = snapshot.throughput_per_min * snapshot.error_rate
            / (1.0 - snapshot.error_rate).max(f64::EPSILON);
        if snapshot.error_rate > 0.0 && errors_per_min > t.high_error_rate_ratio * snapshot.throughput_per_min {
            fired.push(AlertKind::HighErrorRate);
        }
        if snapshot.avg_exec_time > t.slow_execution {
            fired.push(AlertKind::SlowExecution);
        }

        for alert in &fired {
            tracing::warn!(?alert, "queue_health_warning");
        }
        fired
    }

    /// Drop per-task entries older than 2x window, snapshots older than 1h.
    pub fn cleanup(&self) {
        let now = Utc::now();
        let task_cutoff = now - chrono::Duration::from_std(self.config.window * 2).unwrap_or_default();
        self.per_task.retain(|_, m| m.recorded_at >= task_cutoff);

        let snapshot_cutoff = now - chrono::Duration::hours(1);
        self.snapshots.write().retain(|s| s.timestamp >= snapshot_cutoff);
    }

    pub fn per_task_count(&self) -> usize {
        self.per_task.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().len()
    }
}

fn average(values: impl Iterator<Item = Duration>) -> Duration {
    let mut total = Duration::ZERO;
    let mut count = 0u32;
    for v in values {
        total += v;
        count += 1;
    }
    if count == 0 {
        Duration::ZERO
    } else {
        total / count
    }
}
