//! AdmissionController: global/per-type concurrency caps plus a sliding-window
//! rate limiter (§4.4). Process-local; extends the backpressure hysteresis
//! idiom with per-type tracking and a request-timestamp ring buffer.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::task::{Task, TaskId, TaskKind};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid admission limits: {0}")]
    InvalidConfig(String),
}

/// Admission limits. Safe to replace wholesale via `update_limits`; already
/// admitted tasks are never preempted by a tightened limit.
#[derive(Debug, Clone)]
pub struct AdmissionLimits {
    pub max_concurrent_total: usize,
    pub max_concurrent_per_type: HashMap<TaskKind, usize>,
    pub rate_window: Duration,
    pub rate_max_requests: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_concurrent_total: 50,
            max_concurrent_per_type: HashMap::new(),
            rate_window: Duration::from_secs(1),
            rate_max_requests: 100,
        }
    }
}

impl AdmissionLimits {
    pub fn validate(&self) -> Result<(), AdmissionError> {
        if self.max_concurrent_total == 0 {
            return Err(AdmissionError::InvalidConfig(
                "max_concurrent_total must be > 0".into(),
            ));
        }
        if self.rate_max_requests == 0 {
            return Err(AdmissionError::InvalidConfig(
                "rate_max_requests must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn per_type_cap(&self, kind: TaskKind) -> usize {
        self.max_concurrent_per_type
            .get(&kind)
            .copied()
            .unwrap_or(usize::MAX)
    }
}

/// Enforces total/per-type concurrency caps and a sliding-window rate limit
/// over admitted tasks. All state is process-local.
pub struct AdmissionController {
    limits: RwLock<AdmissionLimits>,
    active: DashMap<TaskId, TaskKind>,
    per_type_counts: DashMap<TaskKind, usize>,
    rate_ring: RwLock<Vec<DateTime<Utc>>>,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits: RwLock::new(limits),
            active: DashMap::new(),
            per_type_counts: DashMap::new(),
            rate_ring: RwLock::new(Vec::new()),
        }
    }

    /// Gate a task through all three admission checks (total, per-type, rate).
    /// On success, records the task as active and accounts its admission.
    pub fn acquire(&self, task: &Task) -> bool {
        let limits = self.limits.read();
        let now = Utc::now();

        if self.active.len() >= limits.max_concurrent_total {
            return false;
        }

        let per_type_cap = limits.per_type_cap(task.kind);
        let current_type_count = self.per_type_counts.get(&task.kind).map(|c| *c).unwrap_or(0);
        if current_type_count >= per_type_cap {
            return false;
        }

        {
            let mut ring = self.rate_ring.write();
            prune_ring(&mut ring, now, limits.rate_window);
            if ring.len() >= limits.rate_max_requests {
                return false;
            }
            ring.push(now);
        }

        self.active.insert(task.id, task.kind);
        *self.per_type_counts.entry(task.kind).or_insert(0) += 1;
        true
    }

    /// Release a previously admitted task, freeing its concurrency slot.
    pub fn release(&self, task_id: TaskId) {
        if let Some((_, kind)) = self.active.remove(&task_id) {
            if let Some(mut count) = self.per_type_counts.get_mut(&kind) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Atomically replace the limit struct. Already-active tasks are never preempted.
    pub fn update_limits(&self, limits: AdmissionLimits) -> Result<(), AdmissionError> {
        limits.validate()?;
        *self.limits.write() = limits;
        Ok(())
    }

    /// Busy-poll `acquire` at a fixed interval until admitted or `timeout` elapses.
    pub async fn wait_for_slot(&self, task: &Task, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.acquire(task) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn active_total(&self) -> usize {
        self.active.len()
    }

    pub fn active_for_type(&self, kind: TaskKind) -> usize {
        self.per_type_counts.get(&kind).map(|c| *c).unwrap_or(0)
    }
}

fn prune_ring(ring: &mut Vec<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) {
    let cutoff = now - chrono::Duration::from_std(window).unwrap_or_default();
    ring.retain(|t| *t > cutoff);
}
