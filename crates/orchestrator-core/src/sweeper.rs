//! The stale-lock sweeper (§4.2, §9): a standalone periodic routine, separate
//! from the worker pool's claim-dispatch loop, that reclaims executions whose
//! owning worker died without releasing its claim.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::store::ExecutionStore;

/// Runs the sweeper until `shutdown_rx` reports `true`. Grounded on the
/// teacher's `start_reclaim_loop` (`worker/pool.rs`): a ticker raced against a
/// shutdown signal via `tokio::select!`.
#[instrument(skip(store, shutdown_rx))]
pub async fn run_stale_lock_sweeper<S: ExecutionStore>(
    store: Arc<S>,
    interval: Duration,
    threshold_minutes: i64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), threshold_minutes, "stale-lock sweeper starting");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.reclaim_stale_locks(threshold_minutes).await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "reclaimed stale locks"),
                    Err(e) => error!(error = %e, "stale-lock reclaim failed"),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("stale-lock sweeper stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionPatch, ExecutionStatus};
    use crate::store::InMemoryExecutionStore;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn sweeper_reclaims_then_stops_on_shutdown() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let execution = store.create_execution("demo", "v1", json!({}), None).await.unwrap();
        store
            .update_execution(
                execution.id,
                ExecutionPatch {
                    status: Some(ExecutionStatus::Running),
                    worker_id: Some(Some("dead".to_string())),
                    locked_at: Some(Some(Utc::now() - chrono::Duration::minutes(45))),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store_clone = store.clone();
        let handle = tokio::spawn(async move {
            run_stale_lock_sweeper(store_clone, Duration::from_millis(10), 30, shutdown_rx).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown_tx.send(true);
        handle.await.unwrap();

        let reclaimed = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.status, ExecutionStatus::Pending);
    }
}
