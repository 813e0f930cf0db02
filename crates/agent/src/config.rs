//! Agent step configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_provider() -> String {
    "openai".into()
}

fn default_max_tool_rounds() -> u32 {
    15
}

fn default_max_plan_steps() -> usize {
    10
}

fn default_interaction_timeout() -> u64 {
    300
}

fn default_top_k() -> usize {
    5
}

/// A sub-agent exposed to the outer agent as a single tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillSpec {
    /// Skill name; the tool is `skill__<sanitized name>`.
    pub name: String,
    /// Shown to the model in the tool description and skill catalog.
    #[serde(default)]
    pub description: String,
    /// The sub-agent's system prompt.
    #[serde(default, alias = "systemPrompt")]
    pub system_prompt: String,
}

/// A knowledge base the `knowledge_search` tool queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    /// Knowledge base id.
    pub id: String,
    /// `vector` (Qdrant collection) or `graph`.
    #[serde(rename = "type", default)]
    pub kb_type: String,
    /// Qdrant collection name for vector KBs.
    #[serde(default, alias = "qdrantCollection")]
    pub qdrant_collection: Option<String>,
}

/// Configuration of one `ai` step, decoded from its config map.
///
/// Accepts both snake_case and the camelCase the polymorphic API surface
/// produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model identifier passed to the provider.
    pub model: String,
    /// Provider kind; only `openai`-compatible backends are built in.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Base URL of the chat-completions endpoint.
    #[serde(default, alias = "baseUrl")]
    pub base_url: Option<String>,
    /// API key, when the endpoint wants one.
    #[serde(default, alias = "apiKey")]
    pub api_key: Option<String>,

    /// Caller system prompt, prepended to the composed one.
    #[serde(default, alias = "systemPrompt")]
    pub system_prompt: Option<String>,
    /// The user task; overridden by the `__user_message__` variable.
    #[serde(default)]
    pub prompt: String,
    /// Stream model output through the AI callback.
    #[serde(default)]
    pub streaming: bool,

    /// Builtin tool names to offer.
    #[serde(default)]
    pub tools: Vec<String>,
    /// MCP servers whose tools to fetch and offer.
    #[serde(default, alias = "mcpServerIDs")]
    pub mcp_server_ids: Vec<String>,
    /// Base URL of the MCP proxy.
    #[serde(default, alias = "mcpProxyUrl")]
    pub mcp_proxy_url: Option<String>,
    /// Sub-agents exposed as tools.
    #[serde(default)]
    pub skills: Vec<SkillSpec>,
    /// Knowledge bases for `knowledge_search`.
    #[serde(default, alias = "knowledgeBases")]
    pub knowledge_bases: Vec<KnowledgeBase>,
    /// Offer the `human_interaction` tool.
    #[serde(default)]
    pub interactive: bool,

    /// ReAct round cap.
    #[serde(default = "default_max_tool_rounds", alias = "maxToolRounds")]
    pub max_tool_rounds: u32,
    /// Plan length cap.
    #[serde(default = "default_max_plan_steps", alias = "maxPlanSteps")]
    pub max_plan_steps: usize,
    /// Offer the `switch_to_plan` tool.
    #[serde(default, alias = "enablePlanMode")]
    pub enable_plan_mode: bool,
    /// Enter plan mode on round 1 as if the model had asked.
    #[serde(default, alias = "forcePlan")]
    pub force_plan: bool,

    /// Seconds before a pending interaction resolves to its default.
    #[serde(default = "default_interaction_timeout", alias = "interactionTimeout")]
    pub interaction_timeout: u64,

    /// Embeddings endpoint base (OpenAI-compatible `/v1/embeddings`).
    #[serde(default, alias = "embeddingUrl")]
    pub embedding_url: Option<String>,
    /// Embedding model name.
    #[serde(default, alias = "embeddingModel")]
    pub embedding_model: Option<String>,
    /// Qdrant base URL for vector KBs.
    #[serde(default, alias = "qdrantHost")]
    pub qdrant_host: Option<String>,
    /// Graph search endpoint for graph KBs.
    #[serde(default, alias = "graphSearchUrl")]
    pub graph_search_url: Option<String>,
    /// Score floor for vector hits.
    #[serde(default, alias = "scoreThreshold")]
    pub score_threshold: Option<f64>,
    /// Default `top_k` for knowledge search.
    #[serde(default = "default_top_k", alias = "topK")]
    pub top_k: usize,
}

impl AgentConfig {
    /// The interaction timeout as a duration.
    #[must_use]
    pub fn interaction_timeout(&self) -> Duration {
        Duration::from_secs(self.interaction_timeout.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn defaults_match_the_contract() {
        let config: AgentConfig =
            serde_json::from_value(json!({"model": "gpt-4o", "prompt": "hi"})).unwrap();
        assert_eq!(config.max_tool_rounds, 15);
        assert_eq!(config.max_plan_steps, 10);
        assert_eq!(config.interaction_timeout, 300);
        assert!(!config.enable_plan_mode);
        assert!(!config.interactive);
    }

    #[test]
    fn camel_case_aliases_accepted() {
        let config: AgentConfig = serde_json::from_value(json!({
            "model": "m",
            "systemPrompt": "be brief",
            "maxToolRounds": 3,
            "mcpServerIDs": ["srv-1"],
            "knowledgeBases": [{"id": "kb1", "type": "vector", "qdrantCollection": "docs"}],
            "enablePlanMode": true,
        }))
        .unwrap();
        assert_eq!(config.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(config.max_tool_rounds, 3);
        assert_eq!(config.mcp_server_ids, vec!["srv-1"]);
        assert_eq!(
            config.knowledge_bases[0].qdrant_collection.as_deref(),
            Some("docs")
        );
        assert!(config.enable_plan_mode);
    }
}
