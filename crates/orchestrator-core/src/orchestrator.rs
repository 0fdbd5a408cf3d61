//! The `Orchestrator` facade (§6): the inbound surface of this crate, exposed
//! as plain async methods over a store, resolver, and config bundled
//! together. No HTTP layer lives here — that's an external collaborator's
//! concern (§1).

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{DlqEntry, DlqFilter, Execution, ExecutionFilter, ExecutionPatch, ExecutionStatus, StepResult};
use crate::resolver::{DefinitionResolver, ResolverError};
use crate::store::{ExecutionStore, StoreError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error("execution {0} not found")]
    NotFound(Uuid),

    #[error("execution {0} is already in a terminal state")]
    Conflict(Uuid),
}

/// Bundles a store, resolver, and config into the inbound API described by §6.
/// Cheap to clone: every field is an `Arc` (or, for `Config`, small and owned).
#[derive(Clone)]
pub struct Orchestrator<S: ExecutionStore> {
    store: Arc<S>,
    resolver: Arc<dyn DefinitionResolver>,
}

impl<S: ExecutionStore> Orchestrator<S> {
    pub fn new(store: Arc<S>, resolver: Arc<dyn DefinitionResolver>) -> Self {
        Self { store, resolver }
    }

    /// Creates (or, if `idempotency_key` is already known, returns) a pending
    /// execution pinned to the workflow's latest resolvable version.
    #[tracing::instrument(skip(self, input))]
    pub async fn submit_event(
        &self,
        workflow_name: &str,
        input: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<Execution, OrchestratorError> {
        let definition = self.resolver.resolve(workflow_name, None).await?;
        let execution = self
            .store
            .create_execution(workflow_name, &definition.version, input, idempotency_key)
            .await?;
        Ok(execution)
    }

    /// Cancels an execution. Conflict iff the execution is already terminal
    /// (§4.6): cancellation is a write that sets `status = cancelled` and
    /// `completed_at = now`, permitted from any non-terminal state.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), OrchestratorError> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(OrchestratorError::NotFound(execution_id))?;

        if execution.status.is_terminal() {
            return Err(OrchestratorError::Conflict(execution_id));
        }

        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Cancelled),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// An execution plus its full, append-only step-result history.
    pub async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<(Execution, Vec<StepResult>)>, OrchestratorError> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Ok(None);
        };
        let steps = self.store.list_step_results(execution_id).await?;
        Ok(Some((execution, steps)))
    }

    pub async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<Execution>, OrchestratorError> {
        Ok(self.store.list_executions(filter).await?)
    }

    pub async fn list_dlq(&self, filter: DlqFilter) -> Result<Vec<DlqEntry>, OrchestratorError> {
        Ok(self.store.list_dlq(filter).await?)
    }
}
