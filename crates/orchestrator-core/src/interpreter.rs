//! The step interpreter (§4.4): executes a single step with timeout and handler
//! dispatch, and returns a pure result. The interpreter does not retry, does not
//! persist, and does not know about the store — its only side effects flow through
//! the handler it dispatches to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use uuid::Uuid;

use crate::handlers::{HandlerOutcome, HandlerRegistry};
use crate::model::{LogEntry, LogLevel, Step, StepResult, StepStatus};

/// A cheap, clonable flag a runner can flip to let a long-running handler
/// voluntarily short-circuit (§9 "cancellation granularity" — a design affordance,
/// not something the interpreter enforces on the handler's behalf).
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Execution context passed to the interpreter and through to handlers. Carries the
/// accumulated state (§3: a tagged value tree, traversed by dotted path by the
/// `transform` and `condition` handlers) and a log collector handlers may append to.
pub struct StepContext {
    pub execution_id: Uuid,
    pub state: Value,
    pub cancellation: CancellationToken,
    log: Mutex<Vec<LogEntry>>,
}

impl StepContext {
    pub fn new(execution_id: Uuid, state: Value) -> Self {
        Self {
            execution_id,
            state,
            cancellation: CancellationToken::new(),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Reads a dotted path (`a.b.c`) out of `state`. Numeric segments index arrays.
    /// Missing paths resolve to `None` rather than erroring.
    pub fn read_path(&self, path: &str) -> Option<&Value> {
        read_path(&self.state, path)
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.log.lock().unwrap().push(LogEntry::new(self.execution_id, None, level, message));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Drains the log entries collected during this step's execution.
    pub fn take_logs(&self) -> Vec<LogEntry> {
        std::mem::take(&mut self.log.lock().unwrap())
    }
}

/// Recursive descent over a JSON value tree by dotted path. Not a JSON-path
/// dependency — the path language the built-in handlers need (object-key and
/// array-index segments only) is small enough to hand-write.
pub fn read_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 60_000;

/// Executes a single step with timeout and handler dispatch (§4.4). Always stamps
/// `duration_ms` from entry, regardless of outcome.
pub async fn execute_step(step: &Step, ctx: &StepContext, registry: &HandlerRegistry) -> (StepStatus, Option<Value>, Option<String>, Option<String>, u64) {
    let start = Instant::now();
    let timeout = step.effective_timeout(DEFAULT_STEP_TIMEOUT_MS);

    if let Some(rate) = step.config.get("failureRate").and_then(Value::as_f64) {
        if rand::thread_rng().gen_range(0.0..1.0) < rate {
            return (
                StepStatus::Failed,
                None,
                Some("Simulated random failure".to_string()),
                None,
                elapsed_ms(start),
            );
        }
    }

    let Some(handler) = registry.get(&step.step_type) else {
        return (
            StepStatus::Failed,
            None,
            Some(format!("Unknown step type: {}", step.step_type)),
            None,
            elapsed_ms(start),
        );
    };

    let raced = tokio::time::timeout(timeout, handler.handle(&step.config, ctx)).await;

    match raced {
        Err(_elapsed) => (
            StepStatus::Failed,
            None,
            Some(format!("Step timed out after {}ms", timeout.as_millis())),
            None,
            elapsed_ms(start),
        ),
        Ok(HandlerOutcome::Completed { output, next }) => {
            // A handler only sets `next` when it branches dynamically (e.g. `condition`'s
            // onTrue/onFalse); everything else advances along the step's static successor.
            let next = next.or_else(|| step.next.clone());
            (StepStatus::Completed, Some(output), None, next, elapsed_ms(start))
        }
        Ok(HandlerOutcome::Failed { error }) => (StepStatus::Failed, None, Some(error), None, elapsed_ms(start)),
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Convenience wrapper that assembles a persisted [`StepResult`] from
/// [`execute_step`]'s tuple return, stamping the attempt number the caller supplies.
pub async fn execute_step_result(
    step: &Step,
    ctx: &StepContext,
    registry: &HandlerRegistry,
    execution_id: Uuid,
    attempt: u32,
) -> (StepResult, Option<String>) {
    let started_at = chrono::Utc::now();
    let (status, output, error, next, duration_ms) = execute_step(step, ctx, registry).await;
    let completed_at = chrono::Utc::now();

    (
        StepResult {
            id: Uuid::now_v7(),
            execution_id,
            step_id: step.id.clone(),
            status,
            output,
            error,
            attempt,
            duration_ms,
            started_at,
            completed_at,
        },
        next,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::HandlerRegistry;
    use serde_json::json;

    fn step(id: &str, ty: &str, config: Value) -> Step {
        Step {
            id: id.to_string(),
            step_type: ty.to_string(),
            config,
            next: None,
            on_error: None,
            timeout_ms: None,
            retry_policy: None,
        }
    }

    #[test]
    fn read_path_traverses_objects_and_arrays() {
        let state = json!({"a": {"b": [10, 20, {"c": "deep"}]}});
        assert_eq!(read_path(&state, "a.b.0"), Some(&json!(10)));
        assert_eq!(read_path(&state, "a.b.2.c"), Some(&json!("deep")));
        assert_eq!(read_path(&state, "a.missing"), None);
    }

    #[tokio::test]
    async fn unknown_step_type_fails_with_message() {
        let registry = HandlerRegistry::with_builtins();
        let s = step("s1", "no_such_type", json!({}));
        let ctx = StepContext::new(Uuid::now_v7(), json!({}));
        let (status, _, error, _, _) = execute_step(&s, &ctx, &registry).await;
        assert_eq!(status, StepStatus::Failed);
        assert_eq!(error.unwrap(), "Unknown step type: no_such_type");
    }

    #[tokio::test]
    async fn timeout_fails_with_timed_out_message() {
        let registry = HandlerRegistry::with_builtins();
        let mut s = step("s1", "delay", json!({"durationMs": 500}));
        s.timeout_ms = Some(50);
        let ctx = StepContext::new(Uuid::now_v7(), json!({}));

        let start = Instant::now();
        let (status, _, error, _, _) = execute_step(&s, &ctx, &registry).await;
        assert_eq!(status, StepStatus::Failed);
        assert!(error.unwrap().contains("timed out"));
        assert!(start.elapsed() < Duration::from_millis(400), "timeout must cut the wait short");
    }

    #[tokio::test]
    async fn failure_rate_one_always_fails() {
        let registry = HandlerRegistry::with_builtins();
        let s = step("s1", "log", json!({"message": "hi", "failureRate": 1.0}));
        let ctx = StepContext::new(Uuid::now_v7(), json!({}));
        let (status, _, error, _, _) = execute_step(&s, &ctx, &registry).await;
        assert_eq!(status, StepStatus::Failed);
        assert_eq!(error.unwrap(), "Simulated random failure");
    }

    #[tokio::test]
    async fn successful_log_step_returns_expected_output() {
        let registry = HandlerRegistry::with_builtins();
        let mut s = step("s1", "log", json!({"message": "hi"}));
        s.next = Some("s2".to_string());
        let ctx = StepContext::new(Uuid::now_v7(), json!({}));
        let (status, output, _, next, _) = execute_step(&s, &ctx, &registry).await;
        assert_eq!(status, StepStatus::Completed);
        assert_eq!(output.unwrap(), json!({"logged": true}));
        assert_eq!(next, Some("s2".to_string()));
    }
}
