//! Skills: sub-agents exposed as single-argument tools.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use crate::config::SkillSpec;
use crate::error::AgentError;
use crate::provider::{ChatMessage, ChatProvider, ChatRequest, ToolDefinition};
use crate::tools::{AgentTool, sanitize_tool_name};

/// The tool name for a skill.
#[must_use]
pub fn skill_tool_name(skill_name: &str) -> String {
    format!("skill__{}", sanitize_tool_name(skill_name))
}

/// A named sub-agent callable as `skill__<name>(input)`.
///
/// The skill runs one focused completion under its own system prompt; its
/// answer is the tool result.
pub struct SkillTool {
    provider: Arc<dyn ChatProvider>,
    spec: SkillSpec,
    name: String,
}

impl SkillTool {
    /// Bind a skill spec to the run's provider.
    pub fn new(provider: Arc<dyn ChatProvider>, spec: SkillSpec) -> Self {
        let name = skill_tool_name(&spec.name);
        Self {
            provider,
            spec,
            name,
        }
    }
}

#[async_trait]
impl AgentTool for SkillTool {
    fn definition(&self) -> ToolDefinition {
        let description = if self.spec.description.is_empty() {
            format!("Delegate a task to the '{}' skill.", self.spec.name)
        } else {
            self.spec.description.clone()
        };
        ToolDefinition {
            name: self.name.clone(),
            description,
            parameters: json!({
                "type": "object",
                "properties": {
                    "input": {"type": "string", "description": "The task for the skill"}
                },
                "required": ["input"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> Result<Value, AgentError> {
        let input = arguments
            .get("input")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::tool(&self.name, "missing 'input' argument"))?;

        let system_prompt = if self.spec.system_prompt.is_empty() {
            format!(
                "You are the '{}' skill. {}",
                self.spec.name, self.spec.description
            )
        } else {
            self.spec.system_prompt.clone()
        };

        debug!(skill = %self.spec.name, "running skill sub-agent");
        let response = self
            .provider
            .complete(ChatRequest {
                messages: vec![ChatMessage::system(system_prompt), ChatMessage::user(input)],
                tools: vec![],
            })
            .await?;
        Ok(Value::String(response.content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tool_names_are_prefixed_and_sanitized() {
        assert_eq!(skill_tool_name("summarize"), "skill__summarize");
        assert_eq!(skill_tool_name("web search"), "skill__web_search");
        assert_eq!(skill_tool_name("翻译"), "skill__翻译");
    }
}
