//! Engine error types.

use thiserror::Error;

use trellis_expression::ExpressionError;
use trellis_workflow::{ErrorCode, WorkflowError};

/// Errors raised while registering executors or running steps.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or missing step/hook/processor config.
    #[error("config error: {0}")]
    Config(String),

    /// No executor registered for a type tag.
    #[error("unknown executor type: {0}")]
    UnknownExecutor(String),

    /// A type tag was registered twice.
    #[error("executor type already registered: {0}")]
    DuplicateExecutor(String),

    /// Alias resolution looped.
    #[error("executor alias cycle involving: {0}")]
    AliasCycle(String),

    /// A step body failed.
    #[error("execution error: {0}")]
    Execution(String),

    /// A deadline was exceeded.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A hook failed; the kernel applies skip semantics.
    #[error("hook failure: {0}")]
    Hook(String),

    /// Condition or threshold expression failure.
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// Workflow validation or state-machine failure.
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// The execution was stopped.
    #[error("execution aborted")]
    Aborted,
}

impl EngineError {
    /// Build a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Build an execution error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// The classification recorded in `ExecutionState.errors`.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Config(_) | Self::UnknownExecutor(_) | Self::DuplicateExecutor(_)
            | Self::AliasCycle(_) => ErrorCode::Config,
            Self::Execution(_) | Self::Aborted => ErrorCode::Execution,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Hook(_) => ErrorCode::Hook,
            Self::Expression(ExpressionError::VariableNotFound { .. }) => {
                ErrorCode::VariableNotFound
            }
            Self::Expression(_) => ErrorCode::Expression,
            Self::Workflow(_) => ErrorCode::Validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_error_kinds() {
        assert_eq!(EngineError::config("x").code(), ErrorCode::Config);
        assert_eq!(
            EngineError::Timeout(std::time::Duration::from_secs(1)).code(),
            ErrorCode::Timeout
        );
        assert_eq!(EngineError::Hook("h".into()).code(), ErrorCode::Hook);
        assert_eq!(
            EngineError::Expression(ExpressionError::variable_not_found("x")).code(),
            ErrorCode::VariableNotFound
        );
        assert_eq!(
            EngineError::Expression(ExpressionError::evaluation("bad")).code(),
            ErrorCode::Expression
        );
    }
}
