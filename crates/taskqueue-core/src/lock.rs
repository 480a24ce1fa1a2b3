//! LockManager: named advisory locks layered on top of Storage (§4.2).

use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::storage::{Storage, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("timed out waiting for lock {key}")]
    Timeout { key: String },
}

/// Polling interval used by `wait` between acquire attempts.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// FNV-1a, a deterministic stable 32-bit hash, used to turn a string key into
/// the integer advisory-lock id Postgres' `pg_advisory_lock` family expects.
/// Collisions merely serialize two unrelated tasks; documented as acceptable (§4.2).
pub fn stable_hash(key: &str) -> i64 {
    const FNV_OFFSET: u32 = 0x811c9dc5;
    const FNV_PRIME: u32 = 0x01000193;
    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash as i64
}

/// The task-scoped lock key convention used throughout the scheduler.
pub fn task_lock_key(task_id: uuid::Uuid) -> String {
    format!("task:{task_id}")
}

/// Acquires, releases, and tracks named advisory locks held by this process.
///
/// Locally held keys are tracked so `release_all` (orderly shutdown) can drop
/// every lock this instance holds without the caller needing to remember
/// which keys it acquired. On crash, the database drops the underlying
/// connection-scoped locks on its own, so this is a convenience, not a
/// correctness requirement.
pub struct LockManager {
    store: Arc<dyn Storage>,
    held: DashSet<String>,
}

impl LockManager {
    pub fn new(store: Arc<dyn Storage>) -> Self {
        Self {
            store,
            held: DashSet::new(),
        }
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn acquire(&self, key: &str) -> Result<bool, LockError> {
        let id = stable_hash(key);
        let acquired = self.store.try_advisory_lock(id).await?;
        if acquired {
            self.held.insert(key.to_string());
            tracing::debug!(key, "acquired advisory lock");
        }
        Ok(acquired)
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    pub async fn release(&self, key: &str) -> Result<(), LockError> {
        let id = stable_hash(key);
        self.store.release_advisory_lock(id).await?;
        self.held.remove(key);
        Ok(())
    }

    pub async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let id = stable_hash(key);
        Ok(self.store.check_advisory_lock(id).await?)
    }

    /// Poll `acquire` at a fixed interval until success or `timeout` elapses.
    pub async fn wait(&self, key: &str, timeout: Duration) -> Result<bool, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.acquire(key).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Release every lock this instance currently holds. Invoked on orderly
    /// shutdown by the Orchestrator.
    #[tracing::instrument(skip(self))]
    pub async fn release_all(&self) -> Result<(), LockError> {
        let keys: Vec<String> = self.held.iter().map(|k| k.clone()).collect();
        for key in keys {
            self.release(&key).await?;
        }
        Ok(())
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}
