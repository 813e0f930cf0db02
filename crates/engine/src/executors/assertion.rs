//! The assertion executor.
//!
//! Registered so hooks can guard workflows and steps through the same
//! registry leaves use: `{type: "assertion", config: {expected: ...}}`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use trellis_expression::resolve_value;
use trellis_workflow::{Step, StepResult, StepStatus};

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::executor::StepExecutor;
use crate::processors::apply_operator;

fn default_actual() -> Value {
    Value::Bool(true)
}

fn default_operator() -> String {
    "eq".into()
}

#[derive(Debug, Deserialize)]
struct AssertionStepConfig {
    /// Value under test; `${...}` references resolve first. Defaults to
    /// `true` so `{expected: false}` is a guaranteed failure.
    #[serde(default = "default_actual")]
    actual: Value,
    #[serde(default = "default_operator")]
    operator: String,
    expected: Value,
}

/// Evaluates one assertion as a step. A false assertion is a Failed result.
#[derive(Debug, Default)]
pub struct AssertionExecutor;

#[async_trait]
impl StepExecutor for AssertionExecutor {
    async fn execute(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
    ) -> Result<StepResult, EngineError> {
        let config: AssertionStepConfig =
            serde_json::from_value(Value::Object(step.config.clone()))
                .map_err(|e| EngineError::config(format!("assertion step {}: {e}", step.id)))?;

        let scope = ctx.scope();
        let actual = resolve_value(&scope, &config.actual);
        let expected = resolve_value(&scope, &config.expected);
        let passed = apply_operator(&config.operator, &actual, &expected)?;

        if passed {
            let mut result = StepResult::new(step.id.clone(), StepStatus::Success);
            result.output = Value::Bool(true);
            Ok(result)
        } else {
            Ok(StepResult::failed(
                step.id.clone(),
                format!(
                    "assertion failed: {} {} {}",
                    actual, config.operator, expected
                ),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{CallbackHandle, NoopCallback};
    use crate::context::VarScope;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use trellis_core::ExecutionId;

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            ExecutionId::v4(),
            serde_json::Map::new(),
            CallbackHandle::new(Arc::new(NoopCallback)),
            CancellationToken::new(),
        )
    }

    fn assertion_step(config: Value) -> Step {
        let mut step = Step::leaf("check", "assertion");
        step.config = config.as_object().cloned().unwrap_or_default();
        step
    }

    #[tokio::test]
    async fn expected_false_always_fails() {
        let step = assertion_step(json!({"expected": false}));
        let result = AssertionExecutor.execute(&step, &context()).await.unwrap();
        assert_eq!(result.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn resolves_variables_in_actual() {
        let ctx = context();
        ctx.set_variable("status", json!(200), VarScope::Temp, "test");
        let step = assertion_step(json!({"actual": "${status}", "expected": 200}));
        let result = AssertionExecutor.execute(&step, &ctx).await.unwrap();
        assert_eq!(result.status, StepStatus::Success);
    }

    #[tokio::test]
    async fn supports_comparison_operators() {
        let ctx = context();
        ctx.set_variable("latency", json!(120), VarScope::Temp, "test");
        let step = assertion_step(json!({"actual": "${latency}", "operator": "lt", "expected": 500}));
        let result = AssertionExecutor.execute(&step, &ctx).await.unwrap();
        assert_eq!(result.status, StepStatus::Success);
    }

    #[tokio::test]
    async fn missing_expected_is_config_error() {
        let step = assertion_step(json!({"actual": 1}));
        assert!(matches!(
            AssertionExecutor.execute(&step, &context()).await,
            Err(EngineError::Config(_))
        ));
    }
}
