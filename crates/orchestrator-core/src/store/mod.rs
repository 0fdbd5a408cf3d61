//! The persistent store: durable state for executions, step results, and the DLQ,
//! plus the atomic claim primitive.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryExecutionStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresExecutionStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{
    DlqEntry, DlqFilter, Execution, ExecutionFilter, ExecutionPatch, LogEntry, StepResult,
};

/// Errors surfaced by an [`ExecutionStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable state for executions, step results, the DLQ, and the idempotency index.
///
/// `claim` is the correctness-critical primitive: see its doc comment and §4.2.
/// All other writes to a claimed execution are performed by its owning runner; the
/// store itself exposes no compare-and-swap because runners are the single owner of
/// a claimed row for the duration of that claim.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Creates a pending execution. If `idempotency_key` is already associated with
    /// an execution, returns that execution unchanged — no new row is created, and
    /// every concurrent caller sharing the key observes the same id.
    async fn create_execution(
        &self,
        workflow_name: &str,
        workflow_version: &str,
        input: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<Execution, StoreError>;

    /// The atomic-claim primitive (§4.2). Returns up to `batch_size` executions that
    /// are `pending`, or `retry_scheduled` with `next_retry_at <= now`, ordered
    /// ascending by `created_at`. Every returned row is marked `running`,
    /// `worker_id = worker_id`, `locked_at = now` before any other caller can observe
    /// it; no execution is ever returned to two callers, and no caller blocks on
    /// another caller's claim.
    async fn claim(&self, worker_id: &str, batch_size: usize) -> Result<Vec<Execution>, StoreError>;

    /// Fresh point read.
    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError>;

    /// Partial update of mutable fields. Last-writer-wins on overlapping fields.
    async fn update_execution(&self, id: Uuid, patch: ExecutionPatch) -> Result<(), StoreError>;

    /// Appends one step result. Never overwrites a prior attempt.
    async fn append_step_result(&self, result: StepResult) -> Result<(), StoreError>;

    /// All step results for an execution, in attempt order.
    async fn list_step_results(&self, execution_id: Uuid) -> Result<Vec<StepResult>, StoreError>;

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Execution>, StoreError>;

    /// Operator query; not used by the hot path.
    async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<Execution>, StoreError>;

    /// Appends one DLQ entry. Never overwrites.
    async fn append_dlq_entry(&self, entry: DlqEntry) -> Result<(), StoreError>;

    /// Operator query; not used by the hot path.
    async fn list_dlq(&self, filter: DlqFilter) -> Result<Vec<DlqEntry>, StoreError>;

    /// The stale-lock sweeper (§4.2): clears `worker_id`/`locked_at` and restores
    /// `status = pending` for rows locked past `threshold_minutes`. Returns the
    /// number of rows reclaimed. Intended to be driven by a standalone periodic
    /// task, not the worker pool's poll loop.
    async fn reclaim_stale_locks(&self, threshold_minutes: i64) -> Result<usize, StoreError>;

    /// Appends one row to the optional execution-log trail (§3a). Implementations
    /// may no-op this — the log table is explicitly optional in the persisted state
    /// layout.
    async fn append_execution_log(&self, entry: LogEntry) -> Result<(), StoreError> {
        let _ = entry;
        Ok(())
    }
}
