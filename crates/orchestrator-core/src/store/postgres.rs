//! PostgreSQL implementation of [`ExecutionStore`].
//!
//! Production persistence: the atomic claim primitive is a single
//! `SELECT ... FOR UPDATE SKIP LOCKED` / `UPDATE ... RETURNING` statement in one
//! round trip, per §4.2. Idempotent `create_execution` relies on a unique
//! constraint on `idempotency_key` plus a translation of the unique-violation into
//! a lookup, per §9 — application-level check-then-insert is racy and is not used
//! here.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::{ExecutionStore, StoreError};
use crate::model::{
    DlqEntry, DlqFilter, Execution, ExecutionFilter, ExecutionPatch, ExecutionStatus, LogEntry,
    StepResult, StepStatus,
};

/// PostgreSQL-backed [`ExecutionStore`], built on a `sqlx::PgPool`.
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the crate's migrations against the configured pool.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn parse_status(status: &str) -> Result<ExecutionStatus, StoreError> {
    match status {
        "pending" => Ok(ExecutionStatus::Pending),
        "running" => Ok(ExecutionStatus::Running),
        "retry_scheduled" => Ok(ExecutionStatus::RetryScheduled),
        "completed" => Ok(ExecutionStatus::Completed),
        "failed" => Ok(ExecutionStatus::Failed),
        "cancelled" => Ok(ExecutionStatus::Cancelled),
        other => Err(StoreError::Database(format!("unknown execution status: {other}"))),
    }
}

fn status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Running => "running",
        ExecutionStatus::RetryScheduled => "retry_scheduled",
        ExecutionStatus::Completed => "completed",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Cancelled => "cancelled",
    }
}

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<Execution, StoreError> {
    let status: String = row.get("status");
    Ok(Execution {
        id: row.get("id"),
        workflow_name: row.get("workflow_name"),
        workflow_version: row.get("workflow_version"),
        status: parse_status(&status)?,
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        current_step_id: row.get("current_step_id"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        next_retry_at: row.get("next_retry_at"),
        worker_id: row.get("worker_id"),
        locked_at: row.get("locked_at"),
        idempotency_key: row.get("idempotency_key"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

/// Postgres unique-violation SQLSTATE.
const UNIQUE_VIOLATION: &str = "23505";

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self, input))]
    async fn create_execution(
        &self,
        workflow_name: &str,
        workflow_version: &str,
        input: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<Execution, StoreError> {
        let id = Uuid::now_v7();

        let result = sqlx::query(
            r#"
            INSERT INTO executions (id, workflow_name, workflow_version, status, input, output, retry_count, idempotency_key)
            VALUES ($1, $2, $3, 'pending', $4, '{}'::jsonb, 0, $5)
            RETURNING id, workflow_name, workflow_version, status, input, output, error,
                      current_step_id, retry_count, next_retry_at, worker_id, locked_at,
                      idempotency_key, created_at, started_at, completed_at
            "#,
        )
        .bind(id)
        .bind(workflow_name)
        .bind(workflow_version)
        .bind(&input)
        .bind(&idempotency_key)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => {
                debug!(%id, workflow_name, "created execution");
                row_to_execution(&row)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                let key = idempotency_key.expect("unique violation implies an idempotency key was set");
                debug!(key, "idempotency collision, returning existing execution");
                self.find_by_idempotency_key(&key)
                    .await?
                    .ok_or_else(|| StoreError::Database("idempotency race resolved to no row".to_string()))
            }
            Err(e) => {
                error!("failed to create execution: {e}");
                Err(StoreError::Database(e.to_string()))
            }
        }
    }

    #[instrument(skip(self))]
    async fn claim(&self, worker_id: &str, batch_size: usize) -> Result<Vec<Execution>, StoreError> {
        if batch_size == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM executions
                WHERE (status = 'pending')
                   OR (status = 'retry_scheduled' AND next_retry_at <= NOW())
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE executions e
            SET status = 'running',
                worker_id = $2,
                locked_at = NOW(),
                started_at = COALESCE(e.started_at, NOW()),
                updated_at = NOW()
            FROM claimable c
            WHERE e.id = c.id
            RETURNING e.id, e.workflow_name, e.workflow_version, e.status, e.input, e.output,
                      e.error, e.current_step_id, e.retry_count, e.next_retry_at, e.worker_id,
                      e.locked_at, e.idempotency_key, e.created_at, e.started_at, e.completed_at
            "#,
        )
        .bind(batch_size as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to claim executions: {e}");
            StoreError::Database(e.to_string())
        })?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            claimed.push(row_to_execution(row)?);
        }

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed executions");
        }
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_name, workflow_version, status, input, output, error,
                   current_step_id, retry_count, next_retry_at, worker_id, locked_at,
                   idempotency_key, created_at, started_at, completed_at
            FROM executions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to get execution: {e}");
            StoreError::Database(e.to_string())
        })?;

        row.as_ref().map(row_to_execution).transpose()
    }

    #[instrument(skip(self, patch))]
    async fn update_execution(&self, id: Uuid, patch: ExecutionPatch) -> Result<(), StoreError> {
        // The patch can touch any subset of mutable fields; COALESCE-against-self
        // keeps the statement a single round trip without building dynamic SQL.
        let status = patch.status.map(status_str);
        let result = sqlx::query(
            r#"
            UPDATE executions SET
                status = COALESCE($2, status),
                output = COALESCE($3, output),
                error = CASE WHEN $4 THEN $5 ELSE error END,
                current_step_id = CASE WHEN $6 THEN $7 ELSE current_step_id END,
                retry_count = COALESCE($8, retry_count),
                next_retry_at = CASE WHEN $9 THEN $10 ELSE next_retry_at END,
                worker_id = CASE WHEN $11 THEN $12 ELSE worker_id END,
                locked_at = CASE WHEN $13 THEN $14 ELSE locked_at END,
                started_at = COALESCE($15, started_at),
                completed_at = COALESCE($16, completed_at),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(&patch.output)
        .bind(patch.error.is_some())
        .bind(patch.error.flatten())
        .bind(patch.current_step_id.is_some())
        .bind(patch.current_step_id.flatten())
        .bind(patch.retry_count.map(|v| v as i32))
        .bind(patch.next_retry_at.is_some())
        .bind(patch.next_retry_at.flatten())
        .bind(patch.worker_id.is_some())
        .bind(patch.worker_id.flatten())
        .bind(patch.locked_at.is_some())
        .bind(patch.locked_at.flatten())
        .bind(patch.started_at)
        .bind(patch.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to update execution: {e}");
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, result))]
    async fn append_step_result(&self, result: StepResult) -> Result<(), StoreError> {
        let status = match result.status {
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        };

        sqlx::query(
            r#"
            INSERT INTO step_results
                (id, execution_id, step_id, status, output, error, attempt, duration_ms, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(result.id)
        .bind(result.execution_id)
        .bind(&result.step_id)
        .bind(status)
        .bind(&result.output)
        .bind(&result.error)
        .bind(result.attempt as i32)
        .bind(result.duration_ms as i64)
        .bind(result.started_at)
        .bind(result.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to append step result: {e}");
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_step_results(&self, execution_id: Uuid) -> Result<Vec<StepResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, step_id, status, output, error, attempt, duration_ms, started_at, completed_at
            FROM step_results
            WHERE execution_id = $1
            ORDER BY step_id, attempt
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(StepResult {
                    id: row.get("id"),
                    execution_id: row.get("execution_id"),
                    step_id: row.get("step_id"),
                    status: match status.as_str() {
                        "completed" => StepStatus::Completed,
                        _ => StepStatus::Failed,
                    },
                    output: row.get("output"),
                    error: row.get("error"),
                    attempt: row.get::<i32, _>("attempt") as u32,
                    duration_ms: row.get::<i64, _>("duration_ms") as u64,
                    started_at: row.get("started_at"),
                    completed_at: row.get("completed_at"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_name, workflow_version, status, input, output, error,
                   current_step_id, retry_count, next_retry_at, worker_id, locked_at,
                   idempotency_key, created_at, started_at, completed_at
            FROM executions WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(row_to_execution).transpose()
    }

    #[instrument(skip(self))]
    async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<Execution>, StoreError> {
        let status = filter.status.map(status_str);
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_name, workflow_version, status, input, output, error,
                   current_step_id, retry_count, next_retry_at, worker_id, locked_at,
                   idempotency_key, created_at, started_at, completed_at
            FROM executions
            WHERE ($1::text IS NULL OR workflow_name = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at
            OFFSET $3
            LIMIT $4
            "#,
        )
        .bind(&filter.workflow_name)
        .bind(status)
        .bind(filter.offset.unwrap_or(0) as i64)
        .bind(filter.limit.unwrap_or(100) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_execution).collect()
    }

    #[instrument(skip(self, entry))]
    async fn append_dlq_entry(&self, entry: DlqEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO dlq_entries
                (id, execution_id, workflow_name, workflow_version, reason, last_error, total_attempts, original_input, last_step_id, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(entry.execution_id)
        .bind(&entry.workflow_name)
        .bind(&entry.workflow_version)
        .bind(&entry.reason)
        .bind(&entry.last_error)
        .bind(entry.total_attempts as i32)
        .bind(&entry.original_input)
        .bind(&entry.last_step_id)
        .bind(entry.failed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to append DLQ entry: {e}");
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_dlq(&self, filter: DlqFilter) -> Result<Vec<DlqEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, workflow_name, workflow_version, reason, last_error,
                   total_attempts, original_input, last_step_id, failed_at
            FROM dlq_entries
            WHERE ($1::text IS NULL OR workflow_name = $1)
            ORDER BY failed_at DESC
            OFFSET $2
            LIMIT $3
            "#,
        )
        .bind(&filter.workflow_name)
        .bind(filter.offset.unwrap_or(0) as i64)
        .bind(filter.limit.unwrap_or(100) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| DlqEntry {
                id: row.get("id"),
                execution_id: row.get("execution_id"),
                workflow_name: row.get("workflow_name"),
                workflow_version: row.get("workflow_version"),
                reason: row.get("reason"),
                last_error: row.get("last_error"),
                total_attempts: row.get::<i32, _>("total_attempts") as u32,
                original_input: row.get("original_input"),
                last_step_id: row.get("last_step_id"),
                failed_at: row.get("failed_at"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_locks(&self, threshold_minutes: i64) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::minutes(threshold_minutes);

        let rows = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'pending', worker_id = NULL, locked_at = NULL, updated_at = NOW()
            WHERE status = 'running' AND locked_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to reclaim stale locks: {e}");
            StoreError::Database(e.to_string())
        })?;

        if !rows.is_empty() {
            debug!(count = rows.len(), "reclaimed stale locks");
        }
        Ok(rows.len())
    }

    #[instrument(skip(self, entry))]
    async fn append_execution_log(&self, entry: LogEntry) -> Result<(), StoreError> {
        let level = match entry.level {
            crate::model::LogLevel::Info => "info",
            crate::model::LogLevel::Warn => "warn",
            crate::model::LogLevel::Error => "error",
        };

        sqlx::query(
            r#"
            INSERT INTO execution_logs (execution_id, step_id, level, message, metadata, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.execution_id)
        .bind(&entry.step_id)
        .bind(level)
        .bind(&entry.message)
        .bind(&entry.metadata)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to append execution log: {e}");
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // Integration tests require a live PostgreSQL database and are not run in
    // this environment. `InMemoryExecutionStore` carries the equivalent
    // behavioral coverage against the same `ExecutionStore` trait.
}
