//! PostgreSQL-backed Storage implementation.
//!
//! `claim_one` is implemented with `SELECT ... FOR UPDATE SKIP LOCKED` so that
//! multiple scheduler instances never claim the same row, matching the
//! contract in §4.1.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Instant;

use super::{HealthStatus, Storage, StoreError};
use crate::task::{DlqEntry, MetricSample, Priority, Task, TaskId, TaskPatch, TaskResult, TaskStatus};

#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply bundled migrations. Intended for test setup and first-boot
    /// provisioning; production deployments may prefer a separate migration
    /// step ahead of the service starting.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(())
    }
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::DeadLetter => "dead_letter",
    }
}

fn parse_status(s: &str) -> Result<TaskStatus, StoreError> {
    match s {
        "pending" => Ok(TaskStatus::Pending),
        "in_progress" => Ok(TaskStatus::InProgress),
        "completed" => Ok(TaskStatus::Completed),
        "failed" => Ok(TaskStatus::Failed),
        "dead_letter" => Ok(TaskStatus::DeadLetter),
        other => Err(StoreError::Corrupt(format!("unknown task status {other}"))),
    }
}

fn priority_str(priority: Priority) -> &'static str {
    match priority {
        Priority::Low => "low",
        Priority::Normal => "normal",
        Priority::High => "high",
        Priority::Urgent => "urgent",
    }
}

fn parse_priority(s: &str) -> Result<Priority, StoreError> {
    match s {
        "low" => Ok(Priority::Low),
        "normal" => Ok(Priority::Normal),
        "high" => Ok(Priority::High),
        "urgent" => Ok(Priority::Urgent),
        other => Err(StoreError::Corrupt(format!("unknown priority {other}"))),
    }
}

fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let error: Option<serde_json::Value> = row.try_get("error")?;

    Ok(Task {
        id: row.try_get("id")?,
        kind: kind.parse().map_err(|e: crate::task::InvalidTaskKind| StoreError::Corrupt(e.to_string()))?,
        status: parse_status(&status)?,
        priority: parse_priority(&priority)?,
        weight: row.try_get("weight")?,
        deadline: row.try_get("deadline")?,
        created: row.try_get("created")?,
        updated: row.try_get("updated")?,
        completed_at: row.try_get("completed_at")?,
        retry_count: row.try_get::<i32, _>("retry_count")? as u32,
        error: error
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        result: row.try_get("result")?,
        dependencies: row.try_get("dependencies")?,
        moved_to_dlq_at: row.try_get("moved_to_dlq_at")?,
        heartbeat: row.try_get("heartbeat")?,
        payload: row.try_get("payload")?,
        eligible_at: row.try_get("eligible_at")?,
    })
}

#[async_trait]
impl Storage for PostgresStorage {
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id))]
    async fn save_task(&self, task: Task) -> Result<(), StoreError> {
        let error_json = task.error.as_ref().map(serde_json::to_value).transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, kind, status, priority, weight, deadline, created, updated,
                completed_at, retry_count, error, result, dependencies,
                moved_to_dlq_at, heartbeat, payload, eligible_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
            ON CONFLICT (id) DO UPDATE SET
                kind = EXCLUDED.kind, status = EXCLUDED.status, priority = EXCLUDED.priority,
                weight = EXCLUDED.weight, deadline = EXCLUDED.deadline, updated = EXCLUDED.updated,
                completed_at = EXCLUDED.completed_at, retry_count = EXCLUDED.retry_count,
                error = EXCLUDED.error, result = EXCLUDED.result, dependencies = EXCLUDED.dependencies,
                moved_to_dlq_at = EXCLUDED.moved_to_dlq_at, heartbeat = EXCLUDED.heartbeat,
                payload = EXCLUDED.payload, eligible_at = EXCLUDED.eligible_at
            "#,
        )
        .bind(task.id)
        .bind(task.kind.as_str())
        .bind(status_str(task.status))
        .bind(priority_str(task.priority))
        .bind(task.weight)
        .bind(task.deadline)
        .bind(task.created)
        .bind(task.updated)
        .bind(task.completed_at)
        .bind(task.retry_count as i32)
        .bind(error_json)
        .bind(&task.result)
        .bind(&task.dependencies)
        .bind(task.moved_to_dlq_at)
        .bind(task.heartbeat)
        .bind(&task.payload)
        .bind(task.eligible_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    #[tracing::instrument(skip(self, patch), fields(task_id = %id))]
    async fn update_task(&self, id: TaskId, patch: TaskPatch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        let mut task = row_to_task(&row)?;
        let now = Utc::now();

        if let Some(status) = patch.status {
            task.transition(status, now).map_err(|e| StoreError::Corrupt(e.message))?;
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(retry_count) = patch.retry_count {
            task.retry_count = retry_count;
        }
        if let Some(error) = patch.error {
            task.error = error;
        }
        if let Some(result) = patch.result {
            task.result = result;
        }
        if let Some(completed_at) = patch.completed_at {
            task.completed_at = completed_at;
        }
        if let Some(moved_to_dlq_at) = patch.moved_to_dlq_at {
            task.moved_to_dlq_at = moved_to_dlq_at;
        }
        if let Some(heartbeat) = patch.heartbeat {
            task.heartbeat = heartbeat;
        }
        if let Some(eligible_at) = patch.eligible_at {
            task.eligible_at = eligible_at;
        }
        task.updated = now;

        let error_json = task.error.as_ref().map(serde_json::to_value).transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query(
            r#"
            UPDATE tasks SET
                status = $2, priority = $3, retry_count = $4, error = $5, result = $6,
                completed_at = $7, moved_to_dlq_at = $8, heartbeat = $9, eligible_at = $10,
                updated = $11
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status_str(task.status))
        .bind(priority_str(task.priority))
        .bind(task.retry_count as i32)
        .bind(error_json)
        .bind(&task.result)
        .bind(task.completed_at)
        .bind(task.moved_to_dlq_at)
        .bind(task.heartbeat)
        .bind(task.eligible_at)
        .bind(task.updated)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_pending(&self, limit: Option<usize>) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE status = 'pending' AND eligible_at <= NOW()
            ORDER BY
                CASE priority WHEN 'urgent' THEN 3 WHEN 'high' THEN 2 WHEN 'normal' THEN 1 ELSE 0 END DESC,
                created ASC
            LIMIT $1
            "#,
        )
        .bind(limit.unwrap_or(1000) as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn get_in_progress(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = 'in_progress'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_task).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn claim_one(&self) -> Result<Option<Task>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id FROM tasks
                WHERE status = 'pending' AND eligible_at <= NOW()
                ORDER BY
                    CASE priority WHEN 'urgent' THEN 3 WHEN 'high' THEN 2 WHEN 'normal' THEN 1 ELSE 0 END DESC,
                    created ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks t
            SET status = 'in_progress', updated = NOW()
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.*
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn save_result(&self, task_id: TaskId, result: TaskResult) -> Result<(), StoreError> {
        let error_json = result.error.as_ref().map(serde_json::to_value).transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query(
            "INSERT INTO task_results (task_id, result, error, created) VALUES ($1,$2,$3,$4)",
        )
        .bind(task_id)
        .bind(&result.result)
        .bind(error_json)
        .bind(result.created)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_result(&self, task_id: TaskId) -> Result<Option<TaskResult>, StoreError> {
        let row = sqlx::query(
            "SELECT task_id, result, error, created FROM task_results WHERE task_id = $1 ORDER BY created DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let error: Option<serde_json::Value> = row.try_get("error")?;
        Ok(Some(TaskResult {
            task_id: row.try_get("task_id")?,
            result: row.try_get("result")?,
            error: error
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| StoreError::Corrupt(e.to_string()))?,
            created: row.try_get("created")?,
        }))
    }

    async fn append_metric(&self, sample: MetricSample) -> Result<(), StoreError> {
        let labels = serde_json::to_value(&sample.labels).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query(
            "INSERT INTO metrics (metric_type, value, labels, timestamp) VALUES ($1,$2,$3,$4)",
        )
        .bind(&sample.name)
        .bind(sample.value)
        .bind(labels)
        .bind(sample.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_metrics(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, StoreError> {
        let rows = sqlx::query(
            "SELECT metric_type, value, labels, timestamp FROM metrics WHERE metric_type = $1 AND timestamp BETWEEN $2 AND $3 ORDER BY timestamp",
        )
        .bind(name)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let labels_json: serde_json::Value = row.try_get("labels")?;
                let labels = serde_json::from_value(labels_json).unwrap_or_default();
                Ok(MetricSample {
                    name: row.try_get("metric_type")?,
                    value: row.try_get("value")?,
                    labels,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    async fn try_advisory_lock(&self, lock_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
            .bind(lock_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("acquired")?)
    }

    async fn release_advisory_lock(&self, lock_id: i64) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn check_advisory_lock(&self, lock_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM pg_locks WHERE locktype = 'advisory' AND objid = $1) AS locked",
        )
        .bind(lock_id as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("locked")?)
    }

    #[tracing::instrument(skip(self, task, error_history), fields(task_id = %task.id))]
    async fn move_to_dlq(&self, task: Task, error_history: Vec<String>) -> Result<(), StoreError> {
        let history_json = serde_json::to_value(&error_history).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            UPDATE tasks SET status = 'dead_letter', moved_to_dlq_at = $2, error_history = $3, updated = $2
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(task.moved_to_dlq_at.unwrap_or_else(Utc::now))
        .bind(history_json)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn dlq_count(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM tasks WHERE status = 'dead_letter'")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as usize)
    }

    async fn get_dlq(&self, limit: Option<usize>) -> Result<Vec<DlqEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT *, error_history FROM tasks WHERE status = 'dead_letter' ORDER BY moved_to_dlq_at DESC LIMIT $1",
        )
        .bind(limit.unwrap_or(1000) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let task = row_to_task(row)?;
                let history_json: serde_json::Value = row.try_get("error_history")?;
                let error_history: Vec<String> = serde_json::from_value(history_json).unwrap_or_default();
                Ok(DlqEntry { task, error_history })
            })
            .collect()
    }

    async fn remove_from_dlq(&self, id: TaskId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tasks WHERE id = $1 AND status = 'dead_letter'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cleanup_dlq(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "DELETE FROM tasks WHERE status = 'dead_letter' AND moved_to_dlq_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn cleanup(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "DELETE FROM tasks WHERE status IN ('completed', 'failed') AND updated < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn healthy(&self) -> Result<HealthStatus, StoreError> {
        let start = Instant::now();
        let ok = sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok();
        Ok(HealthStatus {
            latency: start.elapsed(),
            ok,
        })
    }
}
