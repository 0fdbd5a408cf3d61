//! Built-in step handlers (§4.4): `log`, `http`, `transform`, `condition`, `delay`.
//! All five must be present; custom handlers are layered on top via `register`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{HandlerOutcome, StepHandler};
use crate::interpreter::StepContext;
use crate::model::LogLevel;

/// `log`: config `{message, level?}`. Appends a log entry; always completes.
pub struct LogHandler;

#[async_trait]
impl StepHandler for LogHandler {
    fn step_type(&self) -> &str {
        "log"
    }

    async fn handle(&self, config: &Value, ctx: &StepContext) -> HandlerOutcome {
        let message = config.get("message").and_then(Value::as_str).unwrap_or_default();
        let level = match config.get("level").and_then(Value::as_str) {
            Some("warn") => LogLevel::Warn,
            Some("error") => LogLevel::Error,
            _ => LogLevel::Info,
        };
        ctx.log(level, message);
        HandlerOutcome::Completed { output: json!({"logged": true}), next: None }
    }
}

/// `http`: config `{url, method?, headers?, body?}`. On HTTP >= 400, fails. The
/// `reqwest::Client` carries no independent per-request timeout — the interpreter's
/// timeout race (§4.4 step 4) is the single timeout mechanism every step type shares.
#[derive(Default)]
pub struct HttpHandler {
    client: reqwest::Client,
}

#[async_trait]
impl StepHandler for HttpHandler {
    fn step_type(&self) -> &str {
        "http"
    }

    async fn handle(&self, config: &Value, _ctx: &StepContext) -> HandlerOutcome {
        let Some(url) = config.get("url").and_then(Value::as_str) else {
            return HandlerOutcome::Failed { error: "http step requires a url".to_string() };
        };
        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(_) => return HandlerOutcome::Failed { error: format!("invalid HTTP method: {method}") },
        };

        let mut request = self.client.request(method, url);

        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key, value);
                }
            }
        }
        if let Some(body) = config.get("body") {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return HandlerOutcome::Failed { error: e.to_string() },
        };

        let status_code = response.status().as_u16();
        if status_code >= 400 {
            return HandlerOutcome::Failed { error: format!("http request failed with status {status_code}") };
        }

        let data: Value = response.json().await.unwrap_or(Value::Null);
        HandlerOutcome::Completed {
            output: json!({"statusCode": status_code, "data": data}),
            next: None,
        }
    }
}

/// `transform`: config `{mapping: {outKey: "dotted.path"}}`. Missing paths resolve
/// to absent rather than failing the step.
pub struct TransformHandler;

#[async_trait]
impl StepHandler for TransformHandler {
    fn step_type(&self) -> &str {
        "transform"
    }

    async fn handle(&self, config: &Value, ctx: &StepContext) -> HandlerOutcome {
        let Some(mapping) = config.get("mapping").and_then(Value::as_object) else {
            return HandlerOutcome::Failed { error: "transform step requires a mapping".to_string() };
        };

        let mut output = serde_json::Map::new();
        for (out_key, path) in mapping {
            let Some(path) = path.as_str() else { continue };
            if let Some(value) = ctx.read_path(path) {
                output.insert(out_key.clone(), value.clone());
            }
        }

        HandlerOutcome::Completed { output: Value::Object(output), next: None }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Contains,
}

/// `condition`: config `{field, operator, value, onTrue, onFalse}`. Numeric
/// operators (`gt`/`lt`) coerce both operands to `f64`.
pub struct ConditionHandler;

#[async_trait]
impl StepHandler for ConditionHandler {
    fn step_type(&self) -> &str {
        "condition"
    }

    async fn handle(&self, config: &Value, ctx: &StepContext) -> HandlerOutcome {
        let Some(field) = config.get("field").and_then(Value::as_str) else {
            return HandlerOutcome::Failed { error: "condition step requires a field".to_string() };
        };
        let Some(operator) = config
            .get("operator")
            .and_then(Value::as_str)
            .and_then(|s| serde_json::from_value::<Operator>(json!(s)).ok())
        else {
            return HandlerOutcome::Failed { error: "condition step requires a valid operator".to_string() };
        };
        let expected = config.get("value").cloned().unwrap_or(Value::Null);
        let actual = ctx.read_path(field).cloned().unwrap_or(Value::Null);

        let result = match operator {
            Operator::Eq => actual == expected,
            Operator::Ne => actual != expected,
            Operator::Gt => coerce_number(&actual) > coerce_number(&expected),
            Operator::Lt => coerce_number(&actual) < coerce_number(&expected),
            Operator::Contains => match (&actual, &expected) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
        };

        let next = config
            .get(if result { "onTrue" } else { "onFalse" })
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        HandlerOutcome::Completed { output: json!({"condition": result}), next }
    }
}

fn coerce_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.parse().unwrap_or(f64::NAN),
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        _ => f64::NAN,
    }
}

/// `delay`: config `{durationMs}`. A duration exceeding the step's timeout is
/// expected to fail via the interpreter's timeout race (§4.4), not this handler.
pub struct DelayHandler;

#[async_trait]
impl StepHandler for DelayHandler {
    fn step_type(&self) -> &str {
        "delay"
    }

    async fn handle(&self, config: &Value, _ctx: &StepContext) -> HandlerOutcome {
        let duration_ms = config.get("durationMs").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(std::time::Duration::from_millis(duration_ms)).await;
        HandlerOutcome::Completed { output: json!({"delayed": true}), next: None }
    }
}
