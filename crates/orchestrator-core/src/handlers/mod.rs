//! Step-handler registry (§4.6): a process-wide mapping from step type tag to
//! handler implementation, seeded with the built-ins and extensible via
//! [`HandlerRegistry::register`].
//!
//! Unlike a registry keyed on a generic `Input`/`Output` type pair, a handler here
//! operates over untyped `serde_json::Value` config and output: step configs are
//! heterogeneous JSON authored by workflow-definition tooling outside this core,
//! not statically-typed Rust values known at registration time.

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::interpreter::StepContext;

/// The outcome a handler returns to the interpreter, prior to timeout/failure-injection
/// wrapping (§4.4 steps 2–6 are the interpreter's concern, not the handler's).
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Completed { output: Value, next: Option<String> },
    Failed { error: String },
}

/// A single step type's implementation.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// The `type` tag this handler answers to (e.g. `"http"`, `"delay"`).
    fn step_type(&self) -> &str;

    /// Executes the step's work. Implementations that hold external resources
    /// should honor `ctx.is_cancelled()` voluntarily (§9) and should not assume
    /// their work is cancelled just because the interpreter's timeout fires —
    /// the timeout abandons the future, it does not drop the handler's
    /// underlying I/O (§4.4 step 4, §9 "timeout does not cancel work").
    async fn handle(&self, config: &Value, ctx: &StepContext) -> HandlerOutcome;
}

/// Process-wide mapping of step type tag to handler. Lookup is O(1); registration
/// after workers have started is permitted and need not be atomic with in-flight
/// executions.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry seeded with the built-in handlers (`log`, `http`, `transform`,
    /// `condition`, `delay`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(builtin::LogHandler));
        registry.register(Arc::new(builtin::HttpHandler::default()));
        registry.register(Arc::new(builtin::TransformHandler));
        registry.register(Arc::new(builtin::ConditionHandler));
        registry.register(Arc::new(builtin::DelayHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(handler.step_type().to_string(), handler);
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.handlers.contains_key(step_type)
    }
}
