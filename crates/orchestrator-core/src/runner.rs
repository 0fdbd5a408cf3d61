//! The execution runner (§4.5): advances one claimed execution through its graph,
//! persisting after each step, honoring cancel/retry/DLQ policy.
//!
//! The runner is the sole writer to its execution row while `status = running`; it
//! must not be invoked twice concurrently for the same execution — the claim
//! primitive enforces this. Unlike an event-sourced executor that reconstructs
//! state by replaying an event log, this runner resumes purely from the persisted
//! `current_step_id` pointer: no event log, no replay.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::handlers::HandlerRegistry;
use crate::interpreter::{execute_step_result, StepContext};
use crate::model::{
    DlqEntry, Execution, ExecutionPatch, ExecutionStatus, LogLevel, StepStatus,
};
use crate::resolver::{DefinitionResolver, ResolverError};
use crate::retry::RetryPolicy;
use crate::store::{ExecutionStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("execution {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("workflow definition error: {0}")]
    Definition(#[from] ResolverError),

    #[error("execution {0} references unknown step {1}")]
    UnknownStep(Uuid, String),
}

/// Builds the starting state for a fresh or resumed run: the triggering input
/// merged with the execution's accumulated per-step outputs (§4.5), so a
/// `transform`/`condition` step can read an input field by its own dotted path
/// (e.g. `user.id`) rather than nesting it under a reserved key. Step-id keys
/// from `output` take precedence over same-named input fields.
fn build_initial_state(execution: &Execution) -> Value {
    let mut map = execution.input.as_object().cloned().unwrap_or_default();
    if let Some(output) = execution.output.as_object() {
        map.extend(output.clone());
    }
    Value::Object(map)
}

pub struct ExecutionRunner<S: ExecutionStore> {
    store: Arc<S>,
    resolver: Arc<dyn DefinitionResolver>,
    registry: Arc<HandlerRegistry>,
    config: Config,
}

impl<S: ExecutionStore> ExecutionRunner<S> {
    pub fn new(
        store: Arc<S>,
        resolver: Arc<dyn DefinitionResolver>,
        registry: Arc<HandlerRegistry>,
        config: Config,
    ) -> Self {
        Self { store, resolver, registry, config }
    }

    /// Advances a claimed execution one or more steps. Returns once the execution
    /// completes, is scheduled for retry (releasing the worker), moves to the DLQ,
    /// or cancellation is observed.
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn run(&self, execution_id: Uuid) -> Result<(), RunnerError> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(RunnerError::NotFound(execution_id))?;

        let definition = self
            .resolver
            .resolve(&execution.workflow_name, Some(&execution.workflow_version))
            .await?;

        let mut cursor = execution
            .current_step_id
            .clone()
            .unwrap_or_else(|| definition.entry_step().id.clone());
        let mut state = build_initial_state(&execution);
        let mut retry_count = execution.retry_count;

        loop {
            // 1. Cancellation check, before the step.
            if self.bail_if_cancelled(execution_id).await? {
                return Ok(());
            }

            let step = definition
                .step(&cursor)
                .ok_or_else(|| RunnerError::UnknownStep(execution_id, cursor.clone()))?;

            // 2. Persist resume pointer — the crash-safety checkpoint.
            self.store
                .update_execution(
                    execution_id,
                    ExecutionPatch { current_step_id: Some(Some(step.id.clone())), ..Default::default() },
                )
                .await?;

            // 3. Execute.
            let ctx = StepContext::new(execution_id, state.clone());
            let (step_result, next) =
                execute_step_result(step, &ctx, &self.registry, execution_id, retry_count + 1).await;
            for log in ctx.take_logs() {
                let _ = self.store.append_execution_log(log).await;
            }
            self.store.append_step_result(step_result.clone()).await?;

            // 4. Cancellation re-check. The just-finished step's result is already
            // persisted above (§9: persisted for auditability), but no further
            // mutation happens once cancellation is observed.
            if self.bail_if_cancelled(execution_id).await? {
                return Ok(());
            }

            // 5. Branch on result.
            match step_result.status {
                StepStatus::Completed => {
                    if let Value::Object(map) = &mut state {
                        map.insert(step.id.clone(), step_result.output.clone().unwrap_or(Value::Null));
                    }
                    self.store
                        .update_execution(
                            execution_id,
                            ExecutionPatch {
                                output: Some(state.clone()),
                                retry_count: Some(0),
                                next_retry_at: Some(None),
                                ..Default::default()
                            },
                        )
                        .await?;
                    retry_count = 0;

                    match next {
                        Some(next_id) => cursor = next_id,
                        None => {
                            self.complete(execution_id, state).await?;
                            return Ok(());
                        }
                    }
                }
                StepStatus::Failed => {
                    let attempts = retry_count + 1;
                    let policy =
                        RetryPolicy::resolve(step.retry_policy.as_ref(), &self.config.default_retry_policy());

                    if policy.has_attempts_remaining(attempts) {
                        let delay_ms = policy.delay_for_attempt(attempts as i64);
                        let next_retry_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
                        warn!(step_id = %step.id, attempts, "step failed, scheduling retry");
                        self.store
                            .update_execution(
                                execution_id,
                                ExecutionPatch {
                                    status: Some(ExecutionStatus::RetryScheduled),
                                    retry_count: Some(attempts),
                                    next_retry_at: Some(Some(next_retry_at)),
                                    error: Some(step_result.error.clone()),
                                    current_step_id: Some(Some(step.id.clone())),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        return Ok(());
                    }

                    self.fail_terminally(execution_id, &execution, &step.id, step_result.error, attempts, state)
                        .await?;
                    return Ok(());
                }
            }
        }
    }

    async fn bail_if_cancelled(&self, execution_id: Uuid) -> Result<bool, RunnerError> {
        let current = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(RunnerError::NotFound(execution_id))?;

        if current.status == ExecutionStatus::Cancelled {
            info!("cancellation observed, runner exiting without further mutation");
            let _ = self
                .store
                .append_execution_log(crate::model::LogEntry::new(
                    execution_id,
                    None,
                    LogLevel::Info,
                    "cancellation observed",
                ))
                .await;
            return Ok(true);
        }
        Ok(false)
    }

    async fn complete(&self, execution_id: Uuid, state: Value) -> Result<(), RunnerError> {
        info!("execution completed");
        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Completed),
                    output: Some(state),
                    current_step_id: Some(None),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_terminally(
        &self,
        execution_id: Uuid,
        execution: &Execution,
        last_step_id: &str,
        error: Option<String>,
        total_attempts: u32,
        state: Value,
    ) -> Result<(), RunnerError> {
        // The `on_error` successor named on a failing step is deliberately not
        // honored here: the retry-exhausted path always routes to the DLQ (§4.5,
        // §9's recorded decision on the ambiguous source behavior).
        tracing::error!(last_step_id, "execution exhausted retries, moving to DLQ");

        self.store
            .update_execution(
                execution_id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Failed),
                    error: Some(error.clone()),
                    output: Some(state.clone()),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        self.store
            .append_dlq_entry(DlqEntry {
                id: Uuid::now_v7(),
                execution_id,
                workflow_name: execution.workflow_name.clone(),
                workflow_version: execution.workflow_version.clone(),
                reason: "retry budget exhausted".to_string(),
                last_error: error,
                total_attempts,
                original_input: execution.input.clone(),
                last_step_id: Some(last_step_id.to_string()),
                failed_at: Utc::now(),
            })
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RetryPolicy as StepRetryPolicy, Step, WorkflowDefinition};
    use crate::resolver::StaticResolver;
    use crate::store::InMemoryExecutionStore;
    use serde_json::json;

    fn log_step(id: &str, next: Option<&str>) -> Step {
        Step {
            id: id.to_string(),
            step_type: "log".to_string(),
            config: json!({"message": id}),
            next: next.map(String::from),
            on_error: None,
            timeout_ms: None,
            retry_policy: None,
        }
    }

    async fn harness() -> (Arc<InMemoryExecutionStore>, StaticResolver, ExecutionRunner<InMemoryExecutionStore>) {
        let store = Arc::new(InMemoryExecutionStore::new());
        let resolver = StaticResolver::new();
        let registry = Arc::new(HandlerRegistry::with_builtins());
        let runner = ExecutionRunner::new(store.clone(), Arc::new(resolver.clone()), registry, Config::default());
        (store, resolver, runner)
    }

    #[test]
    fn initial_state_merges_input_fields_at_top_level() {
        let execution = Execution::new("demo", "v1", json!({"user": {"id": "u1"}}), None);
        let state = build_initial_state(&execution);
        assert_eq!(state, json!({"user": {"id": "u1"}}));
    }

    #[test]
    fn initial_state_lets_step_output_shadow_same_named_input_field() {
        let mut execution = Execution::new("demo", "v1", json!({}), None);
        execution.output = json!({"a": "from-step"});
        let state = build_initial_state(&execution);
        assert_eq!(state, json!({"a": "from-step"}));
    }

    #[tokio::test]
    async fn happy_path_completes_through_every_step() {
        let (store, resolver, runner) = harness().await;
        resolver
            .register(WorkflowDefinition {
                name: "demo".to_string(),
                version: "v1".to_string(),
                steps: vec![log_step("a", Some("b")), log_step("b", Some("c")), log_step("c", None)],
            })
            .unwrap();

        let execution = store.create_execution("demo", "v1", json!({}), None).await.unwrap();
        store.claim("worker-1", 1).await.unwrap();

        runner.run(execution.id).await.unwrap();

        let finished = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(finished.status, ExecutionStatus::Completed);

        let results = store.list_step_results(execution.id).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.status == StepStatus::Completed && r.attempt == 1));
    }

    #[tokio::test]
    async fn transform_step_reads_trigger_input_by_its_own_dotted_path() {
        let (store, resolver, runner) = harness().await;
        let transform = Step {
            id: "a".to_string(),
            step_type: "transform".to_string(),
            config: json!({"mapping": {"id": "user.id"}}),
            next: None,
            on_error: None,
            timeout_ms: None,
            retry_policy: None,
        };
        resolver
            .register(WorkflowDefinition { name: "demo".to_string(), version: "v1".to_string(), steps: vec![transform] })
            .unwrap();

        let execution = store
            .create_execution("demo", "v1", json!({"user": {"id": "u1"}}), None)
            .await
            .unwrap();
        store.claim("worker-1", 1).await.unwrap();
        runner.run(execution.id).await.unwrap();

        let results = store.list_step_results(execution.id).await.unwrap();
        assert_eq!(results[0].output, Some(json!({"id": "u1"})));
    }

    #[tokio::test]
    async fn retries_exhausted_moves_to_dlq() {
        let (store, resolver, runner) = harness().await;
        let failing = Step {
            id: "a".to_string(),
            step_type: "log".to_string(),
            config: json!({"message": "a", "failureRate": 1.0}),
            next: None,
            on_error: None,
            timeout_ms: None,
            retry_policy: Some(StepRetryPolicy {
                max_attempts: Some(2),
                base_delay_ms: Some(1),
                backoff_multiplier: Some(1.0),
                max_delay_ms: Some(2),
            }),
        };
        resolver
            .register(WorkflowDefinition { name: "demo".to_string(), version: "v1".to_string(), steps: vec![failing] })
            .unwrap();

        let execution = store.create_execution("demo", "v1", json!({}), None).await.unwrap();
        store.claim("worker-1", 1).await.unwrap();
        runner.run(execution.id).await.unwrap();

        // First failure schedules a retry and releases the worker.
        let after_first = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(after_first.status, ExecutionStatus::RetryScheduled);

        // Force the retry to be due, then let the runner re-claim and finish it off.
        store
            .update_execution(
                execution.id,
                ExecutionPatch { next_retry_at: Some(Some(Utc::now())), ..Default::default() },
            )
            .await
            .unwrap();
        store.claim("worker-1", 1).await.unwrap();
        runner.run(execution.id).await.unwrap();

        let finished = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(finished.status, ExecutionStatus::Failed);

        let results = store.list_step_results(execution.id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == StepStatus::Failed));

        let dlq = store.list_dlq(Default::default()).await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].total_attempts, 2);
    }

    #[tokio::test]
    async fn resumes_at_persisted_current_step_id() {
        let (store, resolver, runner) = harness().await;
        resolver
            .register(WorkflowDefinition {
                name: "demo".to_string(),
                version: "v1".to_string(),
                steps: vec![log_step("a", Some("b")), log_step("b", None)],
            })
            .unwrap();

        let execution = store.create_execution("demo", "v1", json!({}), None).await.unwrap();
        store.claim("worker-1", 1).await.unwrap();
        // Simulate a crash having already checkpointed at "b".
        store
            .update_execution(
                execution.id,
                ExecutionPatch { current_step_id: Some(Some("b".to_string())), ..Default::default() },
            )
            .await
            .unwrap();

        runner.run(execution.id).await.unwrap();

        let results = store.list_step_results(execution.id).await.unwrap();
        assert_eq!(results.len(), 1, "step a must not be re-executed");
        assert_eq!(results[0].step_id, "b");
    }

    #[tokio::test]
    async fn cancellation_observed_before_step_halts_without_mutation() {
        let (store, resolver, runner) = harness().await;
        resolver
            .register(WorkflowDefinition {
                name: "demo".to_string(),
                version: "v1".to_string(),
                steps: vec![log_step("a", None)],
            })
            .unwrap();

        let execution = store.create_execution("demo", "v1", json!({}), None).await.unwrap();
        store.claim("worker-1", 1).await.unwrap();
        store
            .update_execution(
                execution.id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Cancelled),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        runner.run(execution.id).await.unwrap();

        let results = store.list_step_results(execution.id).await.unwrap();
        assert!(results.is_empty(), "no step should run once cancelled");
    }
}
