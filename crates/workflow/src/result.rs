//! Step results and typed outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

use trellis_core::{StepId, serde_millis};

/// Outcome of a single step invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The body ran and succeeded.
    Success,
    /// The body ran and failed.
    Failed,
    /// Condition false, pre-hook failure, or an aborted execution.
    Skipped,
    /// The body exceeded its deadline.
    Timeout,
}

impl StepStatus {
    /// Returns `true` for `Success`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns `true` for `Failed` or `Timeout`.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// One assertion outcome, produced by assertion processors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionResult {
    /// Assertion name or derived description.
    pub name: String,
    /// Whether the assertion held.
    pub passed: bool,
    /// Failure detail (or a short confirmation).
    pub message: String,
}

/// The result of one step invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// The step (result ids inside loops carry an `[iteration]` suffix).
    pub step_id: StepId,
    /// Outcome.
    pub status: StepStatus,
    /// Executor output; see [`HttpResponseData`] and [`ScriptOutput`].
    #[serde(default)]
    pub output: Value,
    /// Error description for failed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the step started.
    pub started_at: DateTime<Utc>,
    /// How long it ran.
    #[serde(with = "serde_millis")]
    pub duration: Duration,
    /// Custom numeric metrics emitted by the executor.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, f64>,
    /// Assertion outcomes from processors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<AssertionResult>,
}

impl StepResult {
    /// A result shell with the given status, stamped now.
    pub fn new(step_id: impl Into<StepId>, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            output: Value::Null,
            error: None,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            metrics: HashMap::new(),
            assertions: Vec::new(),
        }
    }

    /// A successful result carrying an output value.
    pub fn success(step_id: impl Into<StepId>, output: Value) -> Self {
        let mut result = Self::new(step_id, StepStatus::Success);
        result.output = output;
        result
    }

    /// A failed result carrying an error description.
    pub fn failed(step_id: impl Into<StepId>, error: impl Into<String>) -> Self {
        let mut result = Self::new(step_id, StepStatus::Failed);
        result.error = Some(error.into());
        result
    }

    /// A skipped result with a reason.
    pub fn skipped(step_id: impl Into<StepId>, reason: impl Into<String>) -> Self {
        let mut result = Self::new(step_id, StepStatus::Skipped);
        result.error = Some(reason.into());
        result
    }

    /// A timeout result.
    pub fn timeout(step_id: impl Into<StepId>, deadline: Duration) -> Self {
        let mut result = Self::new(step_id, StepStatus::Timeout);
        result.error = Some(format!("deadline of {deadline:?} exceeded"));
        result.duration = deadline;
        result
    }

    /// Builder-style duration setter.
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// Snapshot of the request an HTTP executor actually sent, after variable
/// substitution and redirect handling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActualRequest {
    /// Final URL.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Request headers as sent.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Request body as sent.
    #[serde(default)]
    pub body: String,
}

/// Output of the HTTP executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpResponseData {
    /// Response status code.
    pub status_code: u16,
    /// Reason phrase, when the server sent one.
    #[serde(default)]
    pub status_text: String,
    /// Response headers, single-valued: the first value wins.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Cookies from `Set-Cookie`, name to value.
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    /// Raw response body.
    #[serde(default)]
    pub body: String,
    /// Round-trip time in milliseconds.
    pub duration_ms: u64,
    /// The request that produced this response.
    #[serde(default)]
    pub actual_request: ActualRequest,
}

impl HttpResponseData {
    /// Serialize into a step-result output value.
    #[must_use]
    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Output of the script executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptOutput {
    /// The script's final expression value.
    #[serde(default)]
    pub value: Value,
    /// Variable bindings after execution.
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Captured `console.log` lines.
    #[serde(default)]
    pub console_logs: Vec<String>,
}

impl ScriptOutput {
    /// Serialize into a step-result output value.
    #[must_use]
    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_display() {
        assert_eq!(StepStatus::Success.to_string(), "success");
        assert_eq!(StepStatus::Failed.to_string(), "failed");
        assert_eq!(StepStatus::Skipped.to_string(), "skipped");
        assert_eq!(StepStatus::Timeout.to_string(), "timeout");
    }

    #[test]
    fn failure_classification() {
        assert!(StepStatus::Failed.is_failure());
        assert!(StepStatus::Timeout.is_failure());
        assert!(!StepStatus::Skipped.is_failure());
        assert!(StepStatus::Success.is_success());
    }

    #[test]
    fn duration_serializes_as_millis() {
        let result = StepResult::success("a", Value::Null)
            .with_duration(Duration::from_millis(250));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], 250);
        assert_eq!(json["status"], "success");
    }

    #[test]
    fn http_output_roundtrip() {
        let data = HttpResponseData {
            status_code: 200,
            status_text: "OK".into(),
            duration_ms: 42,
            ..HttpResponseData::default()
        };
        let value = data.into_value();
        let back: HttpResponseData = serde_json::from_value(value).unwrap();
        assert_eq!(back.status_code, 200);
        assert_eq!(back.duration_ms, 42);
    }
}
