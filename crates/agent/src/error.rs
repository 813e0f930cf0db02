//! Agent error types.

use thiserror::Error;

/// Errors raised by the agent executor and its tools.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Malformed agent/step configuration.
    #[error("agent config: {0}")]
    Config(String),

    /// The model provider failed.
    #[error("provider: {0}")]
    Provider(String),

    /// HTTP plumbing to a provider or tool backend failed.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// The model's output could not be parsed as expected.
    #[error("parse: {0}")]
    Parse(String),

    /// A tool call failed; surfaced as an error tool result, not a step
    /// failure.
    #[error("tool {name}: {message}")]
    Tool {
        /// The tool.
        name: String,
        /// What went wrong.
        message: String,
    },

    /// The agent deadline elapsed.
    #[error("agent timed out")]
    Timeout,
}

impl AgentError {
    /// Build a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Build a provider error.
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    /// Build a tool error.
    pub fn tool(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            name: name.into(),
            message: message.into(),
        }
    }
}
