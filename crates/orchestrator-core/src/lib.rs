//! # Durable Execution Orchestrator
//!
//! A PostgreSQL-backed engine for running versioned workflow definitions as
//! durable, resumable executions.
//!
//! ## Features
//!
//! - **Crash-safe resume**: executions checkpoint their position after every step;
//!   a crashed worker's claim expires and another worker picks up where it left off
//! - **Automatic retries**: per-step retry policies with exponential backoff and jitter
//! - **Dead-letter queue**: executions that exhaust their retry budget are recorded,
//!   not silently dropped
//! - **Pluggable step handlers**: five built-ins (`log`, `http`, `transform`,
//!   `condition`, `delay`) plus a registry for custom step types
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                             │
//! │  (claims executions on a fixed poll interval, under a       │
//! │   fixed concurrency cap)                                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ExecutionRunner                           │
//! │  (advances one execution step by step, persists after each) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutionStore                          │
//! │  (PostgreSQL: executions, step_results, dlq_entries)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Inbound calls (submitting work, cancelling, reading status) go through the
//! [`Orchestrator`] facade rather than the pool or runner directly; no HTTP
//! layer is implemented in this crate.
//!
//! ## Example
//!
//! ```ignore
//! use orchestrator_core::prelude::*;
//!
//! let store = Arc::new(PostgresExecutionStore::new(pool));
//! let resolver = Arc::new(StaticResolver::new());
//! resolver.register(my_workflow_definition)?;
//! let registry = Arc::new(HandlerRegistry::with_builtins());
//!
//! let orchestrator = Orchestrator::new(store.clone(), resolver.clone());
//! let execution = orchestrator.submit_event("my_workflow", serde_json::json!({}), None).await?;
//!
//! let worker_pool = WorkerPool::new(store, resolver, registry, Config::from_env());
//! worker_pool.run().await;
//! ```

pub mod config;
pub mod handlers;
pub mod interpreter;
pub mod model;
pub mod orchestrator;
pub mod pool;
pub mod resolver;
pub mod retry;
pub mod runner;
pub mod store;
pub mod sweeper;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::handlers::{HandlerOutcome, HandlerRegistry, StepHandler};
    pub use crate::interpreter::{CancellationToken, StepContext};
    pub use crate::model::{
        DlqEntry, DlqFilter, Execution, ExecutionFilter, ExecutionPatch, ExecutionStatus, LogEntry,
        LogLevel, RetryPolicy as StepRetryPolicy, Step, StepResult, StepStatus, WorkflowDefinition,
    };
    pub use crate::orchestrator::{Orchestrator, OrchestratorError};
    pub use crate::pool::WorkerPool;
    pub use crate::resolver::{DefinitionResolver, ResolverError, StaticResolver};
    pub use crate::retry::RetryPolicy;
    pub use crate::runner::{ExecutionRunner, RunnerError};
    pub use crate::store::{ExecutionStore, InMemoryExecutionStore, StoreError};
    #[cfg(feature = "postgres")]
    pub use crate::store::PostgresExecutionStore;
    pub use crate::sweeper::run_stale_lock_sweeper;
}

pub use config::Config;
pub use handlers::{HandlerOutcome, HandlerRegistry, StepHandler};
pub use interpreter::{CancellationToken, StepContext};
pub use model::{
    DlqEntry, DlqFilter, Execution, ExecutionFilter, ExecutionPatch, ExecutionStatus, LogEntry,
    LogLevel, Step, StepResult, StepStatus, WorkflowDefinition,
};
pub use orchestrator::{Orchestrator, OrchestratorError};
pub use pool::WorkerPool;
pub use resolver::{DefinitionResolver, ResolverError, StaticResolver};
pub use retry::RetryPolicy;
pub use runner::{ExecutionRunner, RunnerError};
pub use store::{ExecutionStore, InMemoryExecutionStore, StoreError};
#[cfg(feature = "postgres")]
pub use store::PostgresExecutionStore;
pub use sweeper::run_stale_lock_sweeper;
