//! In-memory [`ExecutionStore`], used for tests and single-process development.
//!
//! Holds the full write guard for the duration of a claim scan-and-mark (no `.await`
//! point inside the critical section), which is sufficient to uphold the claim
//! primitive's two guarantees within a single process: no double-claim, and no
//! caller ever blocks on another caller's claim.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{ExecutionStore, StoreError};
use crate::model::{
    DlqEntry, DlqFilter, Execution, ExecutionFilter, ExecutionPatch, ExecutionStatus, LogEntry,
    StepResult,
};

#[derive(Default)]
struct State {
    executions: HashMap<Uuid, Execution>,
    step_results: HashMap<Uuid, Vec<StepResult>>,
    dlq: Vec<DlqEntry>,
    logs: Vec<LogEntry>,
    idempotency: HashMap<String, Uuid>,
}

/// In-memory implementation of [`ExecutionStore`].
///
/// Not coordinated across processes — appropriate for tests and single-process
/// development only, mirroring the scope the file-backed store served in the
/// original system (§9).
pub struct InMemoryExecutionStore {
    state: RwLock<State>,
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(
        &self,
        workflow_name: &str,
        workflow_version: &str,
        input: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<Execution, StoreError> {
        let mut state = self.state.write();

        if let Some(key) = &idempotency_key {
            if let Some(&existing_id) = state.idempotency.get(key) {
                return Ok(state.executions[&existing_id].clone());
            }
        }

        let execution = Execution::new(workflow_name, workflow_version, input, idempotency_key.clone());
        state.executions.insert(execution.id, execution.clone());
        if let Some(key) = idempotency_key {
            state.idempotency.insert(key, execution.id);
        }
        Ok(execution)
    }

    async fn claim(&self, worker_id: &str, batch_size: usize) -> Result<Vec<Execution>, StoreError> {
        if batch_size == 0 {
            return Ok(vec![]);
        }

        let mut state = self.state.write();
        let now = Utc::now();

        let mut eligible: Vec<Uuid> = state
            .executions
            .values()
            .filter(|e| {
                e.status == ExecutionStatus::Pending
                    || (e.status == ExecutionStatus::RetryScheduled
                        && e.next_retry_at.map(|t| t <= now).unwrap_or(false))
            })
            .map(|e| e.id)
            .collect();

        eligible.sort_by_key(|id| state.executions[id].created_at);
        eligible.truncate(batch_size);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            let execution = state.executions.get_mut(&id).expect("eligible id must exist");
            execution.status = ExecutionStatus::Running;
            execution.worker_id = Some(worker_id.to_string());
            execution.locked_at = Some(now);
            if execution.started_at.is_none() {
                execution.started_at = Some(now);
            }
            claimed.push(execution.clone());
        }

        Ok(claimed)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        Ok(self.state.read().executions.get(&id).cloned())
    }

    async fn update_execution(&self, id: Uuid, patch: ExecutionPatch) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let execution = state.executions.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if let Some(status) = patch.status {
            execution.status = status;
        }
        if let Some(output) = patch.output {
            execution.output = output;
        }
        if let Some(error) = patch.error {
            execution.error = error;
        }
        if let Some(current_step_id) = patch.current_step_id {
            execution.current_step_id = current_step_id;
        }
        if let Some(retry_count) = patch.retry_count {
            execution.retry_count = retry_count;
        }
        if let Some(next_retry_at) = patch.next_retry_at {
            execution.next_retry_at = next_retry_at;
        }
        if let Some(worker_id) = patch.worker_id {
            execution.worker_id = worker_id;
        }
        if let Some(locked_at) = patch.locked_at {
            execution.locked_at = locked_at;
        }
        if let Some(started_at) = patch.started_at {
            execution.started_at = Some(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            execution.completed_at = Some(completed_at);
        }

        Ok(())
    }

    async fn append_step_result(&self, result: StepResult) -> Result<(), StoreError> {
        self.state
            .write()
            .step_results
            .entry(result.execution_id)
            .or_default()
            .push(result);
        Ok(())
    }

    async fn list_step_results(&self, execution_id: Uuid) -> Result<Vec<StepResult>, StoreError> {
        Ok(self
            .state
            .read()
            .step_results
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Execution>, StoreError> {
        let state = self.state.read();
        Ok(state
            .idempotency
            .get(key)
            .and_then(|id| state.executions.get(id))
            .cloned())
    }

    async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<Execution>, StoreError> {
        let state = self.state.read();
        let mut matches: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| {
                filter
                    .workflow_name
                    .as_ref()
                    .map(|name| &e.workflow_name == name)
                    .unwrap_or(true)
            })
            .filter(|e| filter.status.map(|s| e.status == s).unwrap_or(true))
            .cloned()
            .collect();
        matches.sort_by_key(|e| e.created_at);

        let offset = filter.offset.unwrap_or(0) as usize;
        let limit = filter.limit.unwrap_or(u32::MAX) as usize;
        Ok(matches.into_iter().skip(offset).take(limit).collect())
    }

    async fn append_dlq_entry(&self, entry: DlqEntry) -> Result<(), StoreError> {
        self.state.write().dlq.push(entry);
        Ok(())
    }

    async fn list_dlq(&self, filter: DlqFilter) -> Result<Vec<DlqEntry>, StoreError> {
        let state = self.state.read();
        let mut matches: Vec<DlqEntry> = state
            .dlq
            .iter()
            .filter(|e| {
                filter
                    .workflow_name
                    .as_ref()
                    .map(|name| &e.workflow_name == name)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        matches.sort_by_key(|e| e.failed_at);
        matches.reverse();

        let offset = filter.offset.unwrap_or(0) as usize;
        let limit = filter.limit.unwrap_or(u32::MAX) as usize;
        Ok(matches.into_iter().skip(offset).take(limit).collect())
    }

    async fn reclaim_stale_locks(&self, threshold_minutes: i64) -> Result<usize, StoreError> {
        let mut state = self.state.write();
        let cutoff = Utc::now() - chrono::Duration::minutes(threshold_minutes);

        let mut reclaimed = 0;
        for execution in state.executions.values_mut() {
            if execution.status == ExecutionStatus::Running {
                if let Some(locked_at) = execution.locked_at {
                    if locked_at < cutoff {
                        execution.status = ExecutionStatus::Pending;
                        execution.worker_id = None;
                        execution.locked_at = None;
                        reclaimed += 1;
                    }
                }
            }
        }
        Ok(reclaimed)
    }

    async fn append_execution_log(&self, entry: LogEntry) -> Result<(), StoreError> {
        self.state.write().logs.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_and_get() {
        let store = InMemoryExecutionStore::new();
        let execution = store
            .create_execution("demo", "v1", json!({"n": 1}), None)
            .await
            .unwrap();

        let fetched = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, execution.id);
        assert_eq!(fetched.status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn idempotent_create_returns_same_execution() {
        let store = InMemoryExecutionStore::new();
        let first = store
            .create_execution("demo", "v1", json!({}), Some("key-1".to_string()))
            .await
            .unwrap();
        let second = store
            .create_execution("demo", "v1", json!({"different": true}), Some("key-1".to_string()))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.list_executions(ExecutionFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_marks_running_and_sets_locked_at() {
        let store = InMemoryExecutionStore::new();
        store.create_execution("demo", "v1", json!({}), None).await.unwrap();

        let claimed = store.claim("worker-1", 5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, ExecutionStatus::Running);
        assert_eq!(claimed[0].worker_id.as_deref(), Some("worker-1"));
        assert!(claimed[0].locked_at.is_some());

        // A second claim must not return the same row.
        let second = store.claim("worker-2", 5).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn claim_respects_next_retry_at() {
        let store = InMemoryExecutionStore::new();
        let execution = store.create_execution("demo", "v1", json!({}), None).await.unwrap();
        store
            .update_execution(
                execution.id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::RetryScheduled),
                    next_retry_at: Some(Some(Utc::now() + chrono::Duration::seconds(60))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let claimed = store.claim("worker-1", 5).await.unwrap();
        assert!(claimed.is_empty(), "retry not yet due must not be claimed");
    }

    #[tokio::test]
    async fn append_step_result_is_append_only() {
        let store = InMemoryExecutionStore::new();
        let execution = store.create_execution("demo", "v1", json!({}), None).await.unwrap();

        for attempt in 1..=3 {
            store
                .append_step_result(StepResult {
                    id: Uuid::now_v7(),
                    execution_id: execution.id,
                    step_id: "s1".to_string(),
                    status: crate::model::StepStatus::Failed,
                    output: None,
                    error: Some("boom".to_string()),
                    attempt,
                    duration_ms: 1,
                    started_at: Utc::now(),
                    completed_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let results = store.list_step_results(execution.id).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reclaim_stale_locks_restores_pending() {
        let store = InMemoryExecutionStore::new();
        let execution = store.create_execution("demo", "v1", json!({}), None).await.unwrap();
        store
            .update_execution(
                execution.id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Running),
                    worker_id: Some(Some("dead-worker".to_string())),
                    locked_at: Some(Some(Utc::now() - chrono::Duration::minutes(45))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let reclaimed = store.reclaim_stale_locks(30).await.unwrap();
        assert_eq!(reclaimed, 1);

        let fetched = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Pending);
        assert!(fetched.worker_id.is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_never_duplicate() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryExecutionStore::new());
        for _ in 0..20 {
            store.create_execution("demo", "v1", json!({}), None).await.unwrap();
        }

        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim(&format!("worker-{worker}"), 5).await.unwrap()
            }));
        }

        let mut all_ids = std::collections::HashSet::new();
        for handle in handles {
            for execution in handle.await.unwrap() {
                assert!(all_ids.insert(execution.id), "execution claimed twice");
            }
        }
        assert_eq!(all_ids.len(), 20);
    }
}
