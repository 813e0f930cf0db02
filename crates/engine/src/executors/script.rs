//! The sandboxed JavaScript step executor.
//!
//! Scripts run in an embedded [`boa_engine`] context with no host bindings
//! beyond `variables`, `envVars`, and a capturing `console`. The engine is
//! pure Rust, so the sandbox boundary is the interpreter itself.

use async_trait::async_trait;
use boa_engine::{Context, Source, js_string, property::Attribute};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use trellis_workflow::{ScriptOutput, Step, StepResult, StepStatus};

use crate::context::{ExecutionContext, VarScope};
use crate::error::EngineError;
use crate::executor::StepExecutor;
use crate::journal::JournalEntry;

fn default_language() -> String {
    "javascript".into()
}

fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
struct ScriptConfig {
    script: String,
    #[serde(default = "default_language")]
    language: String,
    /// Seconds; scripts are wall-clock bounded, not instruction bounded.
    #[serde(default = "default_timeout_secs")]
    timeout: u64,
}

/// Pure-JS console shim: no native callbacks cross the sandbox boundary.
const PRELUDE: &str = r#"
const __trellis_logs = [];
const console = {
    log: function () {
        var parts = [];
        for (var i = 0; i < arguments.length; i++) {
            var a = arguments[i];
            if (typeof a === 'object' && a !== null) {
                try { parts.push(JSON.stringify(a)); } catch (e) { parts.push(String(a)); }
            } else {
                parts.push(String(a));
            }
        }
        __trellis_logs.push(parts.join(' '));
    }
};
console.info = console.log;
console.warn = console.log;
console.error = console.log;
"#;

/// Run a script synchronously in a fresh interpreter.
///
/// Also used by `js_script` processors; the caller decides what to do with
/// the post-execution variable snapshot.
pub(crate) fn eval_script_blocking(
    script: &str,
    variables: Map<String, Value>,
    env_vars: HashMap<String, String>,
) -> Result<ScriptOutput, EngineError> {
    let mut context = Context::default();
    let js_error = |e: boa_engine::JsError| EngineError::execution(format!("script: {e}"));

    let vars_js = boa_engine::JsValue::from_json(&Value::Object(variables), &mut context)
        .map_err(js_error)?;
    context
        .register_global_property(js_string!("variables"), vars_js, Attribute::all())
        .map_err(|e| EngineError::execution(format!("script: {e}")))?;

    let env_value = serde_json::to_value(env_vars)
        .map_err(|e| EngineError::execution(format!("script env: {e}")))?;
    let env_js = boa_engine::JsValue::from_json(&env_value, &mut context).map_err(js_error)?;
    context
        .register_global_property(js_string!("envVars"), env_js, Attribute::all())
        .map_err(|e| EngineError::execution(format!("script: {e}")))?;

    context
        .eval(Source::from_bytes(PRELUDE))
        .map_err(js_error)?;

    let result = context.eval(Source::from_bytes(script)).map_err(js_error)?;
    let value = if result.is_undefined() || result.is_null() {
        Value::Null
    } else {
        result.to_json(&mut context).map_err(js_error)?
    };

    let logs_js = context
        .eval(Source::from_bytes("__trellis_logs"))
        .map_err(js_error)?;
    let console_logs: Vec<String> =
        serde_json::from_value(logs_js.to_json(&mut context).map_err(js_error)?)
            .unwrap_or_default();

    let vars_js = context
        .eval(Source::from_bytes("variables"))
        .map_err(js_error)?;
    let variables = match vars_js.to_json(&mut context).map_err(js_error)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    Ok(ScriptOutput {
        value,
        variables,
        console_logs,
    })
}

/// Executes `script` steps.
///
/// The script's post-execution `variables` snapshot is written back into
/// the execution context (changed keys only), and console output lands in
/// the journal.
#[derive(Debug, Default)]
pub struct ScriptExecutor;

#[async_trait]
impl StepExecutor for ScriptExecutor {
    async fn execute(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
    ) -> Result<StepResult, EngineError> {
        let config: ScriptConfig = serde_json::from_value(Value::Object(step.config.clone()))
            .map_err(|e| EngineError::config(format!("script step {}: {e}", step.id)))?;
        if !config.language.eq_ignore_ascii_case("javascript") {
            return Err(EngineError::config(format!(
                "unsupported script language: {}",
                config.language
            )));
        }

        let deadline = Duration::from_secs(config.timeout.max(1));
        let before = ctx.variables();
        let env_vars = ctx.env_vars();
        let script = config.script.clone();
        let snapshot = before.clone();

        let started = Instant::now();
        let task =
            tokio::task::spawn_blocking(move || eval_script_blocking(&script, snapshot, env_vars));

        let outcome = tokio::select! {
            () = ctx.cancellation.cancelled() => {
                return Ok(StepResult::skipped(step.id.clone(), "aborted"));
            }
            outcome = tokio::time::timeout(deadline, task) => outcome,
        };

        let output = match outcome {
            Err(_) => return Ok(StepResult::timeout(step.id.clone(), deadline)),
            Ok(Err(join_error)) => {
                return Err(EngineError::execution(format!("script task: {join_error}")));
            }
            Ok(Ok(Err(script_error))) => {
                return Ok(StepResult::failed(step.id.clone(), script_error.to_string())
                    .with_duration(started.elapsed()));
            }
            Ok(Ok(Ok(output))) => output,
        };

        // Write back variables the script changed.
        for (name, value) in &output.variables {
            if before.get(name) != Some(value) {
                ctx.set_variable(
                    name.clone(),
                    value.clone(),
                    VarScope::Temp,
                    format!("script:{}", step.id),
                );
            }
        }
        for line in &output.console_logs {
            ctx.append_journal(JournalEntry::log(format!("script:{}", step.id), line.clone()));
        }

        let mut result = StepResult::new(step.id.clone(), StepStatus::Success);
        result.duration = started.elapsed();
        result.output = output.into_value();
        Ok(result)
    }
}
