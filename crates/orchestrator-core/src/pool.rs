//! The worker pool (§4.7): polls the store for claimable executions at a fixed
//! interval and dispatches each to the runner under a fixed concurrency cap.
//!
//! Deliberately smaller than a backpressure-aware, heartbeating pool: no adaptive
//! poll backoff, no per-worker heartbeat row, no watermark-based admission control.
//! A claimed execution that crashes its worker is picked up by the stale-lock
//! sweeper (§4.2), not by this pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::handlers::HandlerRegistry;
use crate::resolver::DefinitionResolver;
use crate::runner::ExecutionRunner;
use crate::store::ExecutionStore;

/// A running worker pool's handle. Dropping it does not stop the pool — call
/// [`WorkerPool::shutdown`] to drain in-flight executions before dropping.
pub struct WorkerPool<S: ExecutionStore + 'static> {
    worker_id: String,
    store: Arc<S>,
    runner: Arc<ExecutionRunner<S>>,
    concurrency: usize,
    poll_interval: Duration,
    semaphore: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: ExecutionStore + 'static> WorkerPool<S> {
    pub fn new(
        store: Arc<S>,
        resolver: Arc<dyn DefinitionResolver>,
        registry: Arc<HandlerRegistry>,
        config: Config,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let concurrency = config.worker_concurrency.max(1);
        let poll_interval = Duration::from_millis(config.worker_poll_interval_ms);
        let runner = Arc::new(ExecutionRunner::new(store.clone(), resolver, registry, config));

        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            store,
            runner,
            concurrency,
            poll_interval,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// A sender callers can clone out and use elsewhere to trigger shutdown;
    /// `shutdown` itself also sends on it.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Runs the claim-dispatch loop until shutdown is signalled. Does not return
    /// until every in-flight execution this pool dispatched has returned from the
    /// runner.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn run(&self) {
        info!(concurrency = self.concurrency, poll_interval_ms = %self.poll_interval.as_millis(), "worker pool starting");
        let mut ticker = tokio::time::interval(self.poll_interval);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.claim_and_dispatch().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("shutdown signalled, draining in-flight executions");
                        break;
                    }
                }
            }
        }

        // Drain: acquiring every permit blocks until all dispatched tasks release theirs.
        let _ = self.semaphore.acquire_many(self.concurrency as u32).await;
        info!("worker pool stopped");
    }

    /// Signals shutdown and waits for in-flight executions to drain.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn claim_and_dispatch(&self) {
        let available = self.semaphore.available_permits();
        if available == 0 {
            return;
        }

        let claimed = match self.store.claim(&self.worker_id, available).await {
            Ok(executions) => executions,
            Err(e) => {
                error!(error = %e, "claim failed");
                return;
            }
        };

        for execution in claimed {
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("no permits available despite claim batch sizing");
                    break;
                }
            };

            let runner = self.runner.clone();
            let execution_id = execution.id;
            tokio::spawn(async move {
                if let Err(e) = runner.run(execution_id).await {
                    error!(%execution_id, error = %e, "execution runner returned an error");
                }
                drop(permit);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Step, WorkflowDefinition};
    use crate::resolver::StaticResolver;
    use crate::store::InMemoryExecutionStore;
    use serde_json::json;

    fn log_step(id: &str) -> Step {
        Step {
            id: id.to_string(),
            step_type: "log".to_string(),
            config: json!({"message": id}),
            next: None,
            on_error: None,
            timeout_ms: None,
            retry_policy: None,
        }
    }

    #[tokio::test]
    async fn dispatches_claimed_executions_and_drains_on_shutdown() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let resolver = StaticResolver::new();
        resolver
            .register(WorkflowDefinition { name: "demo".to_string(), version: "v1".to_string(), steps: vec![log_step("a")] })
            .unwrap();
        let registry = Arc::new(HandlerRegistry::with_builtins());

        let mut config = Config::default();
        config.worker_poll_interval_ms = 10;
        config.database_url = "unused".to_string();

        let pool = Arc::new(WorkerPool::new(store.clone(), Arc::new(resolver), registry, config));

        let execution = store.create_execution("demo", "v1", json!({}), None).await.unwrap();

        let pool_clone = pool.clone();
        let handle = tokio::spawn(async move { pool_clone.run().await });

        // Give the pool a few ticks to claim and finish the execution.
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.shutdown().await;
        handle.await.unwrap();

        let finished = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(finished.status, crate::model::ExecutionStatus::Completed);
    }
}
