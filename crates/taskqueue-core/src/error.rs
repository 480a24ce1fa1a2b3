//! Recovery-strategy defaults for the error taxonomy (§7).

use crate::task::{ErrorCode, Task};
use std::sync::Arc;
use std::time::Duration;

/// Fallible cleanup hook run before a failed task is either retried or
/// terminally failed/dead-lettered (§4.7 step 3). Errors are logged, never
/// propagated — cleanup is best-effort and must not block the retry decision.
pub type CleanupHook = Arc<dyn Fn(&Task) -> Result<(), anyhow::Error> + Send + Sync>;

/// What to do when a task fails with a given error code.
#[derive(Clone)]
pub struct RecoveryStrategy {
    pub retryable: bool,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub requires_user_input: bool,
    pub cleanup: Option<CleanupHook>,
}

impl RecoveryStrategy {
    const fn new(retryable: bool, max_retries: u32, backoff_ms: u64, requires_user_input: bool) -> Self {
        Self {
            retryable,
            max_retries,
            backoff_ms,
            requires_user_input,
            cleanup: None,
        }
    }

    /// Attach a cleanup hook (e.g. releasing a partial write, invalidating a
    /// cache entry) to run once before this strategy's retry/terminal branch.
    pub fn with_cleanup(mut self, cleanup: CleanupHook) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl std::fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("retryable", &self.retryable)
            .field("max_retries", &self.max_retries)
            .field("backoff_ms", &self.backoff_ms)
            .field("requires_user_input", &self.requires_user_input)
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}

impl PartialEq for RecoveryStrategy {
    fn eq(&self, other: &Self) -> bool {
        self.retryable == other.retryable
            && self.max_retries == other.max_retries
            && self.backoff_ms == other.backoff_ms
            && self.requires_user_input == other.requires_user_input
    }
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self::new(true, 3, 1_000, false)
    }
}

/// Look up the recovery strategy for an error code, falling back to the
/// spec's default (`retryable=true, max_retries=3, backoff_ms=1000`) for any
/// code without a bespoke entry (§7).
pub fn strategy_for(code: ErrorCode) -> RecoveryStrategy {
    use ErrorCode::*;
    match code {
        Unauthorized => RecoveryStrategy::new(false, 0, 0, true),
        InvalidInput => RecoveryStrategy::new(false, 0, 0, true),
        NotFound => RecoveryStrategy::new(false, 0, 0, false),
        RateLimited => RecoveryStrategy::new(true, 5, 2_000, false),
        ServiceUnavailable => RecoveryStrategy::new(true, 5, 2_000, false),
        Internal => RecoveryStrategy::new(true, 3, 1_000, false),
        Network => RecoveryStrategy::new(true, 5, 1_000, false),
        Validation => RecoveryStrategy::new(false, 0, 0, true),
        TaskExecutionFailed => RecoveryStrategy::new(true, 3, 1_000, false),
        TaskTimeout => RecoveryStrategy::new(true, 3, 2_000, false),
        TaskCancelled => RecoveryStrategy::new(false, 0, 0, false),
        TaskValidationFailed => RecoveryStrategy::new(false, 0, 0, true),
        TaskDependencyFailed => RecoveryStrategy::new(true, 2, 5_000, false),
        Configuration => RecoveryStrategy::new(false, 0, 0, true),
        ResourceExhausted => RecoveryStrategy::new(true, 5, 5_000, false),
        ConcurrentRequestsExceeded => RecoveryStrategy::new(true, 5, 500, false),
        NetworkUnavailable => RecoveryStrategy::new(true, 5, 2_000, false),
        ConnectionReset => RecoveryStrategy::new(true, 5, 1_000, false),
        Timeout => RecoveryStrategy::new(true, 3, 2_000, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_user_input_errors_are_never_retryable() {
        for code in [ErrorCode::Unauthorized, ErrorCode::InvalidInput, ErrorCode::Validation] {
            let strategy = strategy_for(code);
            assert!(strategy.requires_user_input);
            assert!(!strategy.retryable);
        }
    }

    #[test]
    fn default_fallback_matches_spec() {
        let default = RecoveryStrategy::default();
        assert!(default.retryable);
        assert_eq!(default.max_retries, 3);
        assert_eq!(default.backoff_ms, 1_000);
    }

    #[test]
    fn default_strategies_carry_no_cleanup_hook() {
        assert!(RecoveryStrategy::default().cleanup.is_none());
    }

    #[test]
    fn with_cleanup_attaches_and_invokes_the_hook() {
        use crate::task::{Priority, TaskKind};
        use std::sync::atomic::{AtomicBool, Ordering};

        let invoked = Arc::new(AtomicBool::new(false));
        let invoked2 = invoked.clone();
        let strategy = RecoveryStrategy::default().with_cleanup(Arc::new(move |_task: &Task| {
            invoked2.store(true, Ordering::SeqCst);
            Ok(())
        }));

        let task = Task::new(TaskKind::Search, Priority::Normal, serde_json::json!({}));
        let cleanup = strategy.cleanup.as_ref().unwrap();
        assert!(cleanup(&task).is_ok());
        assert!(invoked.load(Ordering::SeqCst));
    }
}
