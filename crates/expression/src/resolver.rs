//! `${...}` variable reference resolution.
//!
//! Reference forms:
//!
//! - `env.NAME` — execution env overlay, then process environment; unset
//!   resolves to the empty string and is never an error
//! - `file:/path` — UTF-8 file contents; read errors propagate
//! - `root(.segment|[index])*` — path lookup, variables before results;
//!   `[n]` is normalized to `.n` so `items[1].name` and `items.1.name` are
//!   the same path

use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::sync::LazyLock;

use crate::core::error::{ExpressionError, ExpressionResult};
use crate::scope::EvalScope;

static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap_or_else(|_| unreachable!()));

/// Resolve one reference body (the text between `${` and `}`).
pub fn resolve_reference(scope: &EvalScope, body: &str) -> ExpressionResult<Value> {
    if let Some(name) = body.strip_prefix("env.") {
        return Ok(Value::String(scope.env_var(name).unwrap_or_default()));
    }
    if let Some(path) = body.strip_prefix("file:") {
        return std::fs::read_to_string(path)
            .map(Value::String)
            .map_err(|e| ExpressionError::evaluation_caused_by(format!("read {path}"), e));
    }
    resolve_path(scope, body)
}

/// Resolve a dotted/indexed path against the scope.
pub fn resolve_path(scope: &EvalScope, path: &str) -> ExpressionResult<Value> {
    let segments = split_path(path);
    let Some((root, rest)) = segments.split_first() else {
        return Err(ExpressionError::variable_not_found(path));
    };

    let mut current = scope
        .root(root.as_ref())
        .ok_or_else(|| ExpressionError::variable_not_found(path))?;

    for segment in rest {
        current = descend(current, segment.as_ref())
            .ok_or_else(|| ExpressionError::variable_not_found(path))?;
    }
    Ok(current.clone())
}

/// Substitute every `${...}` in `input` with the display form of its value.
///
/// A reference that fails to resolve is left in place verbatim; one bad
/// reference never poisons the rest of the string.
#[must_use]
pub fn resolve_string(scope: &EvalScope, input: &str) -> String {
    REFERENCE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            match resolve_reference(scope, &caps[1]) {
                Ok(value) => display_value(&value),
                Err(_) => caps[0].to_owned(),
            }
        })
        .into_owned()
}

/// Recursively substitute references inside a JSON value.
///
/// A string that is exactly one reference resolves to the referenced value
/// with its type intact (`"${items}"` stays an array); mixed strings go
/// through [`resolve_string`]. Maps and arrays recurse.
#[must_use]
pub fn resolve_value(scope: &EvalScope, input: &Value) -> Value {
    match input {
        Value::String(s) => {
            if let Some(body) = whole_reference(s) {
                match resolve_reference(scope, body) {
                    Ok(value) => value,
                    Err(_) => input.clone(),
                }
            } else {
                Value::String(resolve_string(scope, s))
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(scope, v)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(scope, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// The display form used for string substitution.
#[must_use]
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_owned(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        composite => serde_json::to_string(composite).unwrap_or_default(),
    }
}

/// Look up a dotted/indexed path inside an arbitrary JSON value.
///
/// Shares the traversal rules of [`resolve_path`] (literal key, then
/// case-insensitive fallback; integer segments index arrays) but starts at
/// `value` instead of the scope roots. Extraction processors use this to
/// pull fields out of response bodies.
#[must_use]
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in split_path(path) {
        current = descend(current, segment.as_ref())?;
    }
    Some(current)
}

/// If `s` is exactly one `${...}` reference, its body.
fn whole_reference(s: &str) -> Option<&str> {
    let m = REFERENCE.captures(s)?;
    let whole = m.get(0)?;
    if whole.start() == 0 && whole.end() == s.len() {
        m.get(1).map(|g| g.as_str())
    } else {
        None
    }
}

/// Split `root.a[0].b` into `["root", "a", "0", "b"]`.
fn split_path(path: &str) -> Vec<Cow<'_, str>> {
    let mut segments = Vec::new();
    let mut rest = path;
    while !rest.is_empty() {
        let boundary = rest.find(['.', '[']).unwrap_or(rest.len());
        if boundary > 0 {
            segments.push(Cow::Borrowed(&rest[..boundary]));
        }
        rest = &rest[boundary..];
        if let Some(stripped) = rest.strip_prefix('.') {
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('[') {
            match stripped.find(']') {
                Some(close) => {
                    segments.push(Cow::Borrowed(&stripped[..close]));
                    rest = stripped[close + 1..].strip_prefix('.').unwrap_or(&stripped[close + 1..]);
                }
                None => {
                    // Unclosed bracket: treat the remainder as one segment.
                    segments.push(Cow::Borrowed(stripped));
                    rest = "";
                }
            }
        }
    }
    segments
}

/// One traversal step into a container.
fn descend<'a>(current: &'a Value, segment: &str) -> Option<&'a Value> {
    match current {
        Value::Object(map) => map.get(segment).or_else(|| {
            // Case-insensitive fallback for keys with no exact match.
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(segment))
                .map(|(_, v)| v)
        }),
        Value::Array(items) => {
            let index: usize = segment.parse().ok()?;
            items.get(index)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    fn scope() -> EvalScope {
        let mut scope = EvalScope::new();
        scope.set_variable("name", json!("trellis"));
        scope.set_variable("count", json!(3));
        scope.set_variable(
            "items",
            json!([{"name": "x"}, {"name": "y"}]),
        );
        scope.set_result("login", json!({"Status": 200, "body": {"success": true}}));
        scope
    }

    #[test]
    fn mixed_string_substitution() {
        assert_eq!(
            resolve_string(&scope(), "hello ${items[1].name}!"),
            "hello y!"
        );
    }

    #[test]
    fn index_and_dot_forms_are_equivalent() {
        let scope = scope();
        assert_eq!(resolve_path(&scope, "items[0].name").unwrap(), json!("x"));
        assert_eq!(resolve_path(&scope, "items.0.name").unwrap(), json!("x"));
    }

    #[test]
    fn case_insensitive_key_fallback() {
        assert_eq!(resolve_path(&scope(), "login.status").unwrap(), json!(200));
    }

    #[test]
    fn exact_key_wins_over_case_fallback() {
        let mut scope = EvalScope::new();
        scope.set_variable("obj", json!({"Key": 1, "key": 2}));
        assert_eq!(resolve_path(&scope, "obj.key").unwrap(), json!(2));
    }

    #[test]
    fn unresolved_reference_left_in_place() {
        assert_eq!(
            resolve_string(&scope(), "a=${missing} b=${count}"),
            "a=${missing} b=3"
        );
    }

    #[test]
    fn out_of_bounds_index_is_not_found() {
        let err = resolve_path(&scope(), "items[9].name").unwrap_err();
        assert!(matches!(err, ExpressionError::VariableNotFound { .. }));
    }

    #[test]
    fn missing_root_is_not_found() {
        let err = resolve_path(&scope(), "nope.field").unwrap_err();
        match err {
            ExpressionError::VariableNotFound { name } => assert_eq!(name, "nope.field"),
            other => panic!("expected VariableNotFound, got {other:?}"),
        }
    }

    #[test]
    fn env_reference_prefers_overlay_and_never_errors() {
        let mut scope = EvalScope::new();
        scope.set_env("TRELLIS_REGION", "eu-1");
        assert_eq!(
            resolve_reference(&scope, "env.TRELLIS_REGION").unwrap(),
            json!("eu-1")
        );
        assert_eq!(
            resolve_reference(&scope, "env.TRELLIS_DEFINITELY_UNSET_VAR_42").unwrap(),
            json!("")
        );
    }

    #[test]
    fn file_reference_reads_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "secret-token").unwrap();
        let body = format!("file:{}", file.path().display());
        assert_eq!(
            resolve_reference(&EvalScope::new(), &body).unwrap(),
            json!("secret-token")
        );
    }

    #[test]
    fn file_reference_error_propagates() {
        let err = resolve_reference(&EvalScope::new(), "file:/definitely/not/here").unwrap_err();
        assert!(matches!(err, ExpressionError::Evaluation { .. }));
    }

    #[test]
    fn whole_reference_keeps_type() {
        let resolved = resolve_value(&scope(), &json!({"list": "${items}", "n": "${count}"}));
        assert!(resolved["list"].is_array());
        assert_eq!(resolved["n"], json!(3));
    }

    #[test]
    fn nested_structures_recurse() {
        let input = json!({
            "url": "https://api/${name}",
            "nested": [{"greeting": "hi ${name}"}],
        });
        let resolved = resolve_value(&scope(), &input);
        assert_eq!(resolved["url"], json!("https://api/trellis"));
        assert_eq!(resolved["nested"][0]["greeting"], json!("hi trellis"));
    }

    #[test]
    fn display_forms() {
        assert_eq!(display_value(&json!("s")), "s");
        assert_eq!(display_value(&json!(10)), "10");
        assert_eq!(display_value(&json!(10.5)), "10.5");
        assert_eq!(display_value(&json!(true)), "true");
        assert_eq!(display_value(&json!(null)), "null");
        assert_eq!(display_value(&json!([1, 2])), "[1,2]");
    }
}
