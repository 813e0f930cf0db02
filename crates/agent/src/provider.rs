//! Chat provider abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// System instructions.
    System,
    /// Human input.
    User,
    /// Model output.
    Assistant,
    /// A tool result addressed to a prior tool call.
    Tool,
}

/// A tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Sanitized tool name.
    pub name: String,
    /// What the tool does, for the model.
    pub description: String,
    /// JSON-schema parameters object.
    pub parameters: Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id; tool results echo it.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Arguments as a JSON text (the wire form models produce).
    pub arguments: String,
}

impl ToolCall {
    /// Parse the arguments, tolerating empty text.
    #[must_use]
    pub fn parsed_arguments(&self) -> Value {
        if self.arguments.trim().is_empty() {
            return Value::Object(serde_json::Map::new());
        }
        serde_json::from_str(&self.arguments).unwrap_or(Value::Null)
    }
}

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: Role,
    /// Text content.
    #[serde(default)]
    pub content: String,
    /// Tool calls (assistant messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// The call this message answers (tool messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// An assistant message, with any tool calls it made.
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// A tool-result message answering `tool_call_id`.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Token accounting, accumulated across every model call of a step.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt(s).
    pub prompt_tokens: u64,
    /// Tokens generated.
    pub completion_tokens: u64,
    /// Sum of both.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Fold another usage into this one.
    pub fn merge(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One model invocation.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Full message list, system first.
    pub messages: Vec<ChatMessage>,
    /// Tools offered for this call; empty means none.
    pub tools: Vec<ToolDefinition>,
}

/// A model response.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    /// Text content (possibly empty when only tools were called).
    pub content: String,
    /// Requested tool calls, in model order.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage for this call.
    pub usage: TokenUsage,
}

/// Sink for streamed content chunks.
pub type ChunkSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// A chat-completion backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// One-shot completion.
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, AgentError>;

    /// Streaming completion; content chunks go to `on_chunk` as they
    /// arrive, and the assembled response is returned.
    ///
    /// The default implementation falls back to [`ChatProvider::complete`]
    /// and emits the content as a single chunk.
    async fn complete_streaming(
        &self,
        request: ChatRequest,
        on_chunk: ChunkSink<'_>,
    ) -> Result<ChatResponse, AgentError> {
        let response = self.complete(request).await?;
        if !response.content.is_empty() {
            on_chunk(&response.content);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parsed_arguments_tolerates_empty() {
        let call = ToolCall {
            id: "c1".into(),
            name: "calc".into(),
            arguments: String::new(),
        };
        assert_eq!(call.parsed_arguments(), serde_json::json!({}));
    }

    #[test]
    fn usage_merges() {
        let mut usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        usage.merge(TokenUsage {
            prompt_tokens: 2,
            completion_tokens: 3,
            total_tokens: 5,
        });
        assert_eq!(usage.total_tokens, 20);
    }
}
