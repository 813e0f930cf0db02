//! The processor pipeline: extraction, variable assignment, assertions, and
//! inline scripts run before and after a step body.

use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

use trellis_expression::{CompareOp, compare_values, lookup_path, resolve_value, resolver};
use trellis_workflow::{AssertionResult, Processor, Step};

use crate::context::{ExecutionContext, VarScope};
use crate::error::EngineError;
use crate::executors::script::eval_script_blocking;
use crate::journal::JournalEntry;

/// Which side of the step body a pipeline runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorPhase {
    /// Before the body; reads incoming variable state.
    Pre,
    /// After the body; reads the step's response.
    Post,
}

/// Run a processor list in declared order.
///
/// Disabled processors are skipped. The first processor error aborts the
/// pipeline and fails the owning step. Assertion outcomes are returned for
/// the step result; a false assertion is not a pipeline error by itself but
/// marks the step failed via the returned results.
pub async fn run_processors(
    phase: ProcessorPhase,
    processors: &[Processor],
    step: &Step,
    ctx: &ExecutionContext,
) -> Result<Vec<AssertionResult>, EngineError> {
    let mut assertions = Vec::new();
    for (index, processor) in processors.iter().enumerate() {
        if !processor.enabled {
            debug!(step = %step.id, processor = %processor.processor_type, ?phase, "processor disabled, skipping");
            continue;
        }
        let source = if processor.id.is_empty() {
            format!("{}:{}[{}]", step.id, processor.processor_type, index)
        } else {
            processor.id.clone()
        };

        match processor.processor_type.as_str() {
            "extract_param" => extract_param(processor, &source, ctx)?,
            "set_variable" => set_variable(processor, &source, ctx)?,
            "assertion" => {
                let result = run_assertion(processor, ctx)?;
                ctx.append_journal(JournalEntry::Assertion {
                    step_id: step.id.clone(),
                    name: result.name.clone(),
                    passed: result.passed,
                    message: result.message.clone(),
                    at: chrono::Utc::now(),
                });
                assertions.push(result);
            }
            "js_script" => js_script(processor, &source, ctx).await?,
            other => {
                return Err(EngineError::config(format!(
                    "unknown processor type: {other}"
                )));
            }
        }
    }
    Ok(assertions)
}

// ── extract_param ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ExtractConfig {
    /// Target variable name.
    name: String,
    /// Where to extract from: `json`, `xml`, `headers`, `regex`.
    source: String,
    /// Path, header name, or pattern, depending on `source`.
    expression: String,
    #[serde(default)]
    scope: Option<String>,
    /// Used when the expression matches nothing.
    #[serde(default)]
    default: Option<Value>,
}

fn extract_param(
    processor: &Processor,
    source_tag: &str,
    ctx: &ExecutionContext,
) -> Result<(), EngineError> {
    let config: ExtractConfig =
        serde_json::from_value(Value::Object(processor.config.clone()))
            .map_err(|e| EngineError::config(format!("extract_param: {e}")))?;

    let response = ctx.response();
    let extracted: Option<Value> = match config.source.as_str() {
        "json" => {
            let body = response
                .as_ref()
                .map(|r| r.body.as_str())
                .unwrap_or_default();
            serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|parsed| lookup_path(&parsed, &config.expression).cloned())
        }
        "xml" => {
            let body = response
                .as_ref()
                .map(|r| r.body.as_str())
                .unwrap_or_default();
            extract_xml(body, &config.expression).map(Value::String)
        }
        "headers" => response.as_ref().and_then(|r| {
            r.headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(&config.expression))
                .map(|(_, value)| Value::String(value.clone()))
        }),
        "regex" => {
            let body = response
                .as_ref()
                .map(|r| r.body.as_str())
                .unwrap_or_default();
            let pattern = Regex::new(&config.expression)
                .map_err(|e| EngineError::config(format!("extract_param regex: {e}")))?;
            pattern.captures(body).map(|caps| {
                let capture = caps.get(1).or_else(|| caps.get(0));
                Value::String(capture.map(|m| m.as_str().to_owned()).unwrap_or_default())
            })
        }
        other => {
            return Err(EngineError::config(format!(
                "extract_param: unknown source {other}"
            )));
        }
    };

    let value = match extracted.or(config.default) {
        Some(value) => value,
        None => {
            return Err(EngineError::execution(format!(
                "extract_param {}: nothing matched '{}' in {}",
                config.name, config.expression, config.source
            )));
        }
    };

    ctx.set_variable(config.name, value, parse_scope(config.scope.as_deref()), source_tag);
    Ok(())
}

/// Extract the text of the first element matching a `a/b/c` tag path (or a
/// bare tag name anywhere in the document).
fn extract_xml(body: &str, path: &str) -> Option<String> {
    let want: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if want.is_empty() {
        return None;
    }
    let mut reader = Reader::from_str(body);
    let mut stack: Vec<String> = Vec::new();
    let mut capturing = false;
    let mut captured = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                stack.push(name);
                if stack_matches(&stack, &want) {
                    capturing = true;
                    captured.clear();
                }
            }
            Ok(Event::Text(text)) if capturing => {
                captured.push_str(&text.decode().ok()?);
            }
            Ok(Event::End(_)) => {
                if capturing && stack_matches(&stack, &want) {
                    return Some(captured.trim().to_owned());
                }
                stack.pop();
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

fn stack_matches(stack: &[String], want: &[&str]) -> bool {
    stack.len() >= want.len()
        && stack[stack.len() - want.len()..]
            .iter()
            .zip(want)
            .all(|(have, want)| have == want)
}

// ── set_variable ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SetVariableConfig {
    name: String,
    value: Value,
    #[serde(default)]
    scope: Option<String>,
}

fn set_variable(
    processor: &Processor,
    source_tag: &str,
    ctx: &ExecutionContext,
) -> Result<(), EngineError> {
    let config: SetVariableConfig =
        serde_json::from_value(Value::Object(processor.config.clone()))
            .map_err(|e| EngineError::config(format!("set_variable: {e}")))?;

    let value = resolve_value(&ctx.scope(), &config.value);
    ctx.set_variable(config.name, value, parse_scope(config.scope.as_deref()), source_tag);
    Ok(())
}

fn parse_scope(scope: Option<&str>) -> VarScope {
    match scope {
        Some("env") => VarScope::Env,
        _ => VarScope::Temp,
    }
}

// ── assertion ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AssertionConfig {
    #[serde(default)]
    name: Option<String>,
    /// `status_code`, `body`, `json`, `headers`, `variable`; defaults to
    /// `status_code` for post-step response checks.
    #[serde(default)]
    source: Option<String>,
    /// Path, header name, or variable name for the sources that need one.
    #[serde(default)]
    field: Option<String>,
    #[serde(default = "default_operator")]
    operator: String,
    expected: Value,
}

fn default_operator() -> String {
    "eq".into()
}

fn run_assertion(
    processor: &Processor,
    ctx: &ExecutionContext,
) -> Result<AssertionResult, EngineError> {
    let config: AssertionConfig =
        serde_json::from_value(Value::Object(processor.config.clone()))
            .map_err(|e| EngineError::config(format!("assertion: {e}")))?;

    let response = ctx.response();
    let source = config.source.as_deref().unwrap_or("status_code");
    let actual: Value = match source {
        "status_code" => response
            .as_ref()
            .map(|r| Value::from(r.status_code))
            .unwrap_or(Value::Null),
        "body" => response
            .as_ref()
            .map(|r| Value::String(r.body.clone()))
            .unwrap_or(Value::Null),
        "json" => {
            let body = response
                .as_ref()
                .map(|r| r.body.as_str())
                .unwrap_or_default();
            let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
            match &config.field {
                Some(path) => lookup_path(&parsed, path).cloned().unwrap_or(Value::Null),
                None => parsed,
            }
        }
        "headers" => {
            let name = config.field.as_deref().unwrap_or_default();
            response
                .as_ref()
                .and_then(|r| {
                    r.headers
                        .iter()
                        .find(|(have, _)| have.eq_ignore_ascii_case(name))
                        .map(|(_, value)| Value::String(value.clone()))
                })
                .unwrap_or(Value::Null)
        }
        "variable" => {
            let name = config.field.as_deref().unwrap_or_default();
            ctx.get_variable(name).unwrap_or(Value::Null)
        }
        other => {
            return Err(EngineError::config(format!(
                "assertion: unknown source {other}"
            )));
        }
    };

    let expected = resolve_value(&ctx.scope(), &config.expected);
    let passed = apply_operator(&config.operator, &actual, &expected)?;

    let name = config.name.unwrap_or_else(|| {
        format!(
            "{} {} {}",
            source,
            config.operator,
            resolver::display_value(&expected)
        )
    });
    let message = if passed {
        "ok".to_owned()
    } else {
        format!(
            "expected {} {} {}, got {}",
            source,
            config.operator,
            resolver::display_value(&expected),
            resolver::display_value(&actual)
        )
    };
    Ok(AssertionResult { name, passed, message })
}

/// Apply an assertion operator.
///
/// Comparison operators share the condition language's coercion rules;
/// `contains`/`regex` work on display forms; `exists` checks non-null.
pub(crate) fn apply_operator(
    operator: &str,
    actual: &Value,
    expected: &Value,
) -> Result<bool, EngineError> {
    let compare = |op: CompareOp| compare_values(op, actual, expected);
    Ok(match operator {
        "eq" | "==" => compare(CompareOp::Eq),
        "ne" | "!=" => compare(CompareOp::Ne),
        "gt" | ">" => compare(CompareOp::Gt),
        "lt" | "<" => compare(CompareOp::Lt),
        "ge" | ">=" => compare(CompareOp::Ge),
        "le" | "<=" => compare(CompareOp::Le),
        "contains" => resolver::display_value(actual).contains(&resolver::display_value(expected)),
        "not_contains" => {
            !resolver::display_value(actual).contains(&resolver::display_value(expected))
        }
        "exists" => !actual.is_null(),
        "regex" => {
            let pattern = Regex::new(&resolver::display_value(expected))
                .map_err(|e| EngineError::config(format!("assertion regex: {e}")))?;
            pattern.is_match(&resolver::display_value(actual))
        }
        other => {
            return Err(EngineError::config(format!(
                "assertion: unknown operator {other}"
            )));
        }
    })
}

// ── js_script ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsScriptConfig {
    script: String,
}

async fn js_script(
    processor: &Processor,
    source_tag: &str,
    ctx: &ExecutionContext,
) -> Result<(), EngineError> {
    let config: JsScriptConfig =
        serde_json::from_value(Value::Object(processor.config.clone()))
            .map_err(|e| EngineError::config(format!("js_script: {e}")))?;

    let before = ctx.variables();
    let env_vars = ctx.env_vars();
    let script = config.script.clone();
    let snapshot: Map<String, Value> = before.clone();
    let env: HashMap<String, String> = env_vars;

    let output = tokio::task::spawn_blocking(move || eval_script_blocking(&script, snapshot, env))
        .await
        .map_err(|e| EngineError::execution(format!("js_script task: {e}")))??;

    for (name, value) in &output.variables {
        if before.get(name) != Some(value) {
            ctx.set_variable(name.clone(), value.clone(), VarScope::Temp, source_tag);
        }
    }
    for line in &output.console_logs {
        ctx.append_journal(JournalEntry::log(source_tag, line.clone()));
    }
    Ok(())
}
