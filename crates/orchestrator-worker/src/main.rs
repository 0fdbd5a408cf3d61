use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use orchestrator_core::{
    run_stale_lock_sweeper, Config, HandlerRegistry, PostgresExecutionStore, StaticResolver, WorkerPool,
    WorkflowDefinition,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orchestrator_worker=debug,orchestrator_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("orchestrator-worker starting...");

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    tracing::info!("database connection established");

    let store = Arc::new(PostgresExecutionStore::new(pool));
    store.migrate().await.context("failed to run migrations")?;

    let resolver = Arc::new(StaticResolver::new());
    let definitions_dir = std::env::var("WORKFLOW_DEFINITIONS_DIR").unwrap_or_else(|_| "./workflows".to_string());
    let loaded = load_definitions(&resolver, Path::new(&definitions_dir))?;
    tracing::info!(count = loaded, dir = %definitions_dir, "loaded workflow definitions");

    let registry = Arc::new(HandlerRegistry::with_builtins());
    let stale_lock_threshold_min = config.claim_stale_lock_threshold_min;

    let worker_pool = Arc::new(WorkerPool::new(store.clone(), resolver, registry, config));
    tracing::info!(worker_id = worker_pool.worker_id(), "worker pool initialized");

    let run_handle = {
        let worker_pool = worker_pool.clone();
        tokio::spawn(async move { worker_pool.run().await })
    };

    // The stale-lock sweeper is a separate periodic routine, not part of the
    // pool's claim-dispatch loop; it shares the pool's shutdown signal.
    let sweeper_shutdown_rx = worker_pool.shutdown_handle().subscribe();
    let sweeper_handle = tokio::spawn(run_stale_lock_sweeper(
        store,
        std::time::Duration::from_secs(60),
        stale_lock_threshold_min,
        sweeper_shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining in-flight executions");
    worker_pool.shutdown().await;
    run_handle.await?;
    sweeper_handle.await?;

    tracing::info!("worker pool stopped");
    Ok(())
}

/// Loads every `*.json` file in `dir` as a workflow definition. Definition
/// authoring and versioning live outside this binary (§6); this is the minimal
/// loader a single-binary deployment needs to get definitions into the resolver.
fn load_definitions(resolver: &StaticResolver, dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        tracing::warn!(dir = %dir.display(), "workflow definitions directory does not exist, starting with none registered");
        return Ok(0);
    }

    let mut loaded = 0;
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }

        let contents = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let definition: WorkflowDefinition =
            serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        resolver
            .register(definition)
            .map_err(|e| anyhow::anyhow!("invalid workflow definition in {}: {e}", path.display()))?;
        loaded += 1;
    }

    Ok(loaded)
}
