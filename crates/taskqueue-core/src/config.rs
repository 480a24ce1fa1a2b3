//! Layered configuration (§10.3): typed structs with `Default` impls,
//! optionally overlaid with environment variables via `dotenvy`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::TaskKind;

/// Serde support for `Duration` as milliseconds, matching the convention
/// used throughout this crate's configuration structs.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// The full set of enumerated options from §6, grouped by owning component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    #[serde(with = "duration_millis")]
    pub poll_backoff_ceiling: Duration,
    #[serde(with = "duration_millis")]
    pub task_timeout: Duration,

    pub max_concurrent_total: usize,
    #[serde(default)]
    pub max_concurrent_per_type: HashMap<TaskKind, usize>,
    #[serde(with = "duration_millis")]
    pub rate_window: Duration,
    pub rate_max_requests: usize,

    pub max_retries: u32,
    pub retry_backoff_base_ms: u64,

    #[serde(with = "duration_millis")]
    pub recovery_interval: Duration,
    #[serde(with = "duration_millis")]
    pub recovery_window: Duration,
    pub max_concurrent_recoveries: usize,

    pub max_queue_size: usize,
    pub max_dlq_size: usize,
    #[serde(with = "duration_millis")]
    pub dlq_retention: Duration,
    pub dlq_retry_limit: u32,
    pub dlq_alert_threshold: usize,

    #[serde(with = "duration_millis")]
    pub metrics_window: Duration,
    #[serde(with = "duration_millis")]
    pub metrics_cleanup_interval: Duration,

    pub worker_min: usize,
    pub worker_max: usize,
    #[serde(with = "duration_millis")]
    pub worker_scale_check_interval: Duration,
    pub worker_high_watermark: usize,
    pub worker_low_watermark: usize,

    #[serde(with = "duration_millis")]
    pub shutdown_grace_period: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            poll_backoff_ceiling: Duration::from_secs(10),
            task_timeout: Duration::from_secs(30),

            max_concurrent_total: 50,
            max_concurrent_per_type: HashMap::new(),
            rate_window: Duration::from_secs(1),
            rate_max_requests: 100,

            max_retries: 3,
            retry_backoff_base_ms: 1_000,

            recovery_interval: Duration::from_secs(60),
            recovery_window: Duration::from_secs(60),
            max_concurrent_recoveries: 10,

            max_queue_size: 10_000,
            max_dlq_size: 1_000,
            dlq_retention: Duration::from_secs(7 * 24 * 3600),
            dlq_retry_limit: 3,
            dlq_alert_threshold: 100,

            metrics_window: Duration::from_secs(60),
            metrics_cleanup_interval: Duration::from_secs(300),

            worker_min: 2,
            worker_max: 20,
            worker_scale_check_interval: Duration::from_secs(10),
            worker_high_watermark: 100,
            worker_low_watermark: 10,

            shutdown_grace_period: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// Load defaults, then overlay environment variables (via `dotenvy`'s
    /// `.env` loading) for the fields this deployment is most often tuned on.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(v) = std::env::var("QUEUE_MAX_CONCURRENT_TOTAL") {
            if let Ok(parsed) = v.parse() {
                config.max_concurrent_total = parsed;
            }
        }
        if let Ok(v) = std::env::var("QUEUE_WORKER_MAX") {
            if let Ok(parsed) = v.parse() {
                config.worker_max = parsed;
            }
        }
        if let Ok(v) = std::env::var("QUEUE_TASK_TIMEOUT_MS") {
            if let Ok(parsed) = v.parse::<u64>() {
                config.task_timeout = Duration::from_millis(parsed);
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_values() {
        let config = QueueConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_backoff_base_ms, 1_000);
        assert_eq!(config.worker_min, 2);
    }

    #[test]
    fn round_trips_through_json() {
        let config = QueueConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: QueueConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.poll_interval, config.poll_interval);
    }
}
