#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Trellis Expression
//!
//! The boolean condition language that gates workflow steps, and the
//! `${path}` variable resolver used everywhere a config value can reference
//! execution state.
//!
//! ## Condition language
//!
//! Precedence (low to high): `OR` < `AND` < `NOT` < comparison < primary.
//! Operator keywords are case-insensitive; `&&`, `||` and `!` are accepted
//! as synonyms, as are `===`/`!==` for `==`/`!=`.
//!
//! ```
//! use trellis_expression::{EvalScope, Expression};
//!
//! let mut scope = EvalScope::new();
//! scope.set_variable("a", serde_json::json!(10));
//! scope.set_variable("b", serde_json::json!(20));
//!
//! let expr = Expression::parse("${a} < ${b} AND ${a} > 0").unwrap();
//! assert!(expr.evaluate(&scope).unwrap());
//! ```
//!
//! Comparisons coerce both sides to `f64` when possible and fall back to
//! lexicographic string comparison. `AND`/`OR` short-circuit: a decided left
//! side suppresses evaluation of (and any errors in) the right side.
//!
//! ## Variable references
//!
//! A reference is `${...}` where the body is one of:
//!
//! - `env.NAME` — execution env-var overlay first, then the process
//!   environment; unset resolves to the empty string, never an error
//! - `file:/path` — UTF-8 file contents; read errors propagate
//! - a path `root(.segment|[index])*` — looked up in variables first, then
//!   step results; `[n]` is normalized to `.n`

pub mod core;
pub mod eval;
pub mod resolver;
pub mod scope;

pub use self::core::ast::{CompareOp, Expr};
pub use self::core::error::{ExpressionError, ExpressionResult};
pub use self::core::parser::Parser;
pub use eval::{Evaluator, compare_values};
pub use resolver::{lookup_path, resolve_path, resolve_string, resolve_value};
pub use scope::EvalScope;

/// A parsed condition expression, ready for repeated evaluation.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parse an expression from source text.
    pub fn parse(source: &str) -> ExpressionResult<Self> {
        let ast = Parser::new(source)?.parse()?;
        Ok(Self {
            source: source.to_owned(),
            ast,
        })
    }

    /// The original source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The parsed AST.
    #[must_use]
    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Evaluate to a boolean in the given scope.
    ///
    /// The final value is coerced: booleans as-is, nonzero numbers are true,
    /// `"true"`/`"1"` are true, `"false"`/`"0"`/`""` are false, null is
    /// false; anything else is a type mismatch.
    pub fn evaluate(&self, scope: &EvalScope) -> ExpressionResult<bool> {
        let value = Evaluator::new(scope).eval(&self.ast)?;
        eval::coerce_bool(&value)
    }

    /// Evaluate to the raw (uncoerced) value in the given scope.
    pub fn evaluate_value(&self, scope: &EvalScope) -> ExpressionResult<serde_json::Value> {
        Evaluator::new(scope).eval(&self.ast)
    }
}

/// Parse and evaluate `source` in one call.
pub fn evaluate(source: &str, scope: &EvalScope) -> ExpressionResult<bool> {
    Expression::parse(source)?.evaluate(scope)
}
