//! Expression error types.

use thiserror::Error;

/// Result alias for expression operations.
pub type ExpressionResult<T> = Result<T, ExpressionError>;

/// Errors produced while parsing or evaluating a condition expression, or
/// while resolving a `${...}` variable reference.
#[derive(Debug, Clone, Error)]
pub enum ExpressionError {
    /// The source text is not a valid expression.
    #[error("parse error at {position}: expected {expected}, got {got}")]
    Parse {
        /// Byte offset of the offending token.
        position: usize,
        /// What the parser was looking for.
        expected: String,
        /// What it found instead.
        got: String,
    },

    /// Evaluation failed for a reason other than types or missing variables.
    #[error("evaluation error: {message}")]
    Evaluation {
        /// Human-readable description.
        message: String,
        /// Underlying cause, when one exists.
        cause: Option<String>,
    },

    /// A value had the wrong type for the operation or the final coercion.
    #[error("type mismatch: expected {expected}, got {got} ({value})")]
    TypeMismatch {
        /// The type the operation required.
        expected: String,
        /// The type actually present.
        got: String,
        /// Display form of the offending value.
        value: String,
    },

    /// A `${...}` reference did not resolve.
    #[error("variable not found: {name}")]
    VariableNotFound {
        /// The unresolved path.
        name: String,
    },
}

impl ExpressionError {
    /// Build a parse error.
    pub fn parse(position: usize, expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::Parse {
            position,
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Build an evaluation error without a cause.
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
            cause: None,
        }
    }

    /// Build an evaluation error wrapping an underlying cause.
    pub fn evaluation_caused_by(
        message: impl Into<String>,
        cause: impl std::fmt::Display,
    ) -> Self {
        Self::Evaluation {
            message: message.into(),
            cause: Some(cause.to_string()),
        }
    }

    /// Build a type mismatch error.
    pub fn type_mismatch(
        expected: impl Into<String>,
        got: impl Into<String>,
        value: impl std::fmt::Display,
    ) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            got: got.into(),
            value: value.to_string(),
        }
    }

    /// Build a variable-not-found error.
    pub fn variable_not_found(name: impl Into<String>) -> Self {
        Self::VariableNotFound { name: name.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_display() {
        let err = ExpressionError::parse(4, "expression", "end of input");
        assert_eq!(
            err.to_string(),
            "parse error at 4: expected expression, got end of input"
        );
    }

    #[test]
    fn variable_not_found_display() {
        let err = ExpressionError::variable_not_found("login.status");
        assert_eq!(err.to_string(), "variable not found: login.status");
    }

    #[test]
    fn type_mismatch_display() {
        let err = ExpressionError::type_mismatch("bool", "object", "{}");
        assert_eq!(err.to_string(), "type mismatch: expected bool, got object ({})");
    }
}
