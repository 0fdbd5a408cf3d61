//! Core data types: executions, step results, DLQ entries, and workflow definitions.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    RetryScheduled,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// A terminal status never mutates further (§3 invariant).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// One run of a workflow definition against a specific input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_name: String,
    pub workflow_version: String,
    pub status: ExecutionStatus,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub error: Option<String>,
    pub current_step_id: Option<String>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(
        workflow_name: impl Into<String>,
        workflow_version: impl Into<String>,
        input: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_name: workflow_name.into(),
            workflow_version: workflow_version.into(),
            status: ExecutionStatus::Pending,
            input,
            output: serde_json::Value::Object(Default::default()),
            error: None,
            current_step_id: None,
            retry_count: 0,
            next_retry_at: None,
            worker_id: None,
            locked_at: None,
            idempotency_key,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Partial update applied to an execution row. `None` fields are left untouched;
/// use `ClearableField` for fields that must be explicitly nulled.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub output: Option<serde_json::Value>,
    pub error: Option<Option<String>>,
    pub current_step_id: Option<Option<String>>,
    pub retry_count: Option<u32>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub worker_id: Option<Option<String>>,
    pub locked_at: Option<Option<DateTime<Utc>>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Status of one attempt of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// Durable record of one attempt of one step. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub status: StepStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempt: u32,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Append-only record of an execution that exhausted its retry budget or failed terminally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub workflow_version: String,
    pub reason: String,
    pub last_error: Option<String>,
    pub total_attempts: u32,
    pub original_input: serde_json::Value,
    pub last_step_id: Option<String>,
    pub failed_at: DateTime<Utc>,
}

/// Level of a persisted execution-log line (§3a). Distinct from process-wide `tracing` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One entry in an execution's durable log trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub execution_id: Uuid,
    pub step_id: Option<String>,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(execution_id: Uuid, step_id: Option<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            execution_id,
            step_id,
            level,
            message: message.into(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }
}

/// Retry policy attached to a step. Fields absent from a step definition fall back to
/// the configured defaults (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

/// One node in a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub on_error: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl Step {
    pub fn effective_timeout(&self, default_ms: u64) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(default_ms))
    }
}

/// A workflow definition pinned to a specific version, already validated by the
/// resolver that produced it (§6 outbound contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    pub fn entry_step(&self) -> &Step {
        &self.steps[0]
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Validates the invariants the resolver is required to uphold (§6): non-empty,
    /// unique ids, and `next`/`on_error` references resolve within the definition.
    pub fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("workflow definition has no steps".to_string());
        }
        let mut seen = HashMap::new();
        for step in &self.steps {
            if seen.insert(step.id.as_str(), ()).is_some() {
                return Err(format!("duplicate step id: {}", step.id));
            }
        }
        for step in &self.steps {
            if let Some(next) = &step.next {
                if self.step(next).is_none() {
                    return Err(format!("step {} references unknown next {}", step.id, next));
                }
            }
            if let Some(on_error) = &step.on_error {
                if self.step(on_error).is_none() {
                    return Err(format!(
                        "step {} references unknown on_error {}",
                        step.id, on_error
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Filter for `list_executions` operator queries.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub workflow_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Filter for `list_dlq` operator queries.
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub workflow_name: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}
