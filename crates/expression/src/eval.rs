//! AST evaluation.

use serde_json::Value;

use crate::core::ast::{CompareOp, Expr};
use crate::core::error::{ExpressionError, ExpressionResult};
use crate::resolver::{display_value, resolve_reference};
use crate::scope::EvalScope;

/// Evaluator over a lookup scope.
#[derive(Debug)]
pub struct Evaluator<'a> {
    scope: &'a EvalScope,
}

impl<'a> Evaluator<'a> {
    /// Create an evaluator for the given scope.
    #[must_use]
    pub fn new(scope: &'a EvalScope) -> Self {
        Self { scope }
    }

    /// Evaluate an expression to its raw value.
    pub fn eval(&self, expr: &Expr) -> ExpressionResult<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),

            Expr::VarRef(path) | Expr::Ident(path) => resolve_reference(self.scope, path),

            Expr::Not(inner) => {
                let value = self.eval(inner)?;
                Ok(Value::Bool(!coerce_bool(&value)?))
            }

            Expr::And(left, right) => {
                let left_val = self.eval(left)?;
                if !coerce_bool(&left_val)? {
                    // Short-circuit: the right side is not evaluated, so
                    // errors in it are suppressed.
                    return Ok(Value::Bool(false));
                }
                let right_val = self.eval(right)?;
                Ok(Value::Bool(coerce_bool(&right_val)?))
            }

            Expr::Or(left, right) => {
                let left_val = self.eval(left)?;
                if coerce_bool(&left_val)? {
                    return Ok(Value::Bool(true));
                }
                let right_val = self.eval(right)?;
                Ok(Value::Bool(coerce_bool(&right_val)?))
            }

            Expr::Compare { op, left, right } => {
                let left_val = self.eval(left)?;
                let right_val = self.eval(right)?;
                Ok(Value::Bool(compare_values(*op, &left_val, &right_val)))
            }
        }
    }
}

/// Compare two values: as `f64` when both coerce numerically, otherwise by
/// lexicographic comparison of their display forms.
///
/// This is the comparison the condition language uses; assertion processors
/// reuse it so `"200" == 200` holds in both places.
#[must_use]
pub fn compare_values(op: CompareOp, left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (numeric(left), numeric(right)) {
        return match op {
            CompareOp::Eq => l == r,
            CompareOp::Ne => l != r,
            CompareOp::Lt => l < r,
            CompareOp::Gt => l > r,
            CompareOp::Le => l <= r,
            CompareOp::Ge => l >= r,
        };
    }

    let l = display_value(left);
    let r = display_value(right);
    match op {
        CompareOp::Eq => l == r,
        CompareOp::Ne => l != r,
        CompareOp::Lt => l < r,
        CompareOp::Gt => l > r,
        CompareOp::Le => l <= r,
        CompareOp::Ge => l >= r,
    }
}

/// Numeric coercion: numbers directly, strings that parse as `f64`.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Coerce a value to the final boolean result.
///
/// Booleans pass through; nonzero numbers are true; `"true"`/`"1"` are true
/// and `"false"`/`"0"`/`""` are false; null is false. Anything else is a
/// type mismatch.
pub fn coerce_bool(value: &Value) -> ExpressionResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" | "" => Ok(false),
            _ => Err(ExpressionError::type_mismatch("bool", "string", s)),
        },
        Value::Null => Ok(false),
        other => Err(ExpressionError::type_mismatch(
            "bool",
            type_name(other),
            display_value(other),
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::Parser;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn eval(source: &str, scope: &EvalScope) -> ExpressionResult<Value> {
        let ast = Parser::new(source).unwrap().parse().unwrap();
        Evaluator::new(scope).eval(&ast)
    }

    fn eval_bool(source: &str, scope: &EvalScope) -> ExpressionResult<bool> {
        eval(source, scope).and_then(|v| coerce_bool(&v))
    }

    fn scope() -> EvalScope {
        let mut scope = EvalScope::new();
        scope.set_variable("a", json!(10));
        scope.set_variable("b", json!(20));
        scope.set_variable("name", json!("trellis"));
        scope
    }

    #[test]
    fn numeric_comparison_across_types() {
        let mut scope = EvalScope::new();
        scope.set_variable("s", json!("10"));
        assert!(eval_bool("${s} == 10", &scope).unwrap());
        assert!(eval_bool("${s} >= 9.5", &scope).unwrap());
    }

    #[test]
    fn lexicographic_fallback() {
        let scope = scope();
        assert!(eval_bool("${name} == 'trellis'", &scope).unwrap());
        assert!(eval_bool("'abc' < 'abd'", &scope).unwrap());
        assert!(!eval_bool("'b' < 'a'", &scope).unwrap());
    }

    #[test]
    fn bool_literal_comparison() {
        let mut scope = EvalScope::new();
        scope.set_variable("ok", json!(true));
        assert!(eval_bool("${ok} == true", &scope).unwrap());
        assert!(eval_bool("${ok} != false", &scope).unwrap());
    }

    #[test]
    fn and_short_circuit_suppresses_right_errors() {
        let mut scope = EvalScope::new();
        scope.set_variable("a", json!(1));
        // ${missing} would raise VariableNotFound if evaluated.
        assert!(!eval_bool("${a} == 2 AND ${missing}", &scope).unwrap());
    }

    #[test]
    fn or_short_circuit_suppresses_right_errors() {
        let mut scope = EvalScope::new();
        scope.set_variable("a", json!(1));
        assert!(eval_bool("${a} == 1 OR ${missing}", &scope).unwrap());
    }

    #[test]
    fn undecided_left_still_evaluates_right() {
        let mut scope = EvalScope::new();
        scope.set_variable("a", json!(1));
        let err = eval_bool("${a} == 1 AND ${missing}", &scope).unwrap_err();
        assert!(matches!(err, ExpressionError::VariableNotFound { .. }));
    }

    #[test]
    fn not_inverts() {
        let scope = scope();
        assert!(!eval_bool("NOT ${a} == 10", &scope).unwrap());
        assert!(eval_bool("NOT NOT ${a} == 10", &scope).unwrap());
    }

    #[rstest]
    #[case(json!(true), true)]
    #[case(json!(false), false)]
    #[case(json!(1), true)]
    #[case(json!(-0.5), true)]
    #[case(json!(0), false)]
    #[case(json!("true"), true)]
    #[case(json!("1"), true)]
    #[case(json!("false"), false)]
    #[case(json!("0"), false)]
    #[case(json!(""), false)]
    #[case(json!(null), false)]
    fn truthiness_table(#[case] value: Value, #[case] expected: bool) {
        assert_eq!(coerce_bool(&value).unwrap(), expected);
    }

    #[test]
    fn truthiness_rejects_other_strings_and_composites() {
        assert!(matches!(
            coerce_bool(&json!("maybe")),
            Err(ExpressionError::TypeMismatch { .. })
        ));
        assert!(matches!(
            coerce_bool(&json!({"k": 1})),
            Err(ExpressionError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn condition_error_surfaces_variable_name() {
        let err = eval_bool("NOT ${unknown}", &EvalScope::new()).unwrap_err();
        match err {
            ExpressionError::VariableNotFound { name } => assert_eq!(name, "unknown"),
            other => panic!("expected VariableNotFound, got {other:?}"),
        }
    }
}
