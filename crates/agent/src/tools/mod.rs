//! The tool catalog: builtin tools, MCP tools, skills, HITL, knowledge
//! search, and the plan-mode escape.

pub mod hitl;
pub mod knowledge;
pub mod mcp;
pub mod skill;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use trellis_core::StepId;
use trellis_engine::ExecutionContext;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::provider::{ChatProvider, ToolDefinition};

/// Name of the plan-mode escape tool.
pub const SWITCH_TO_PLAN: &str = "switch_to_plan";

/// A tool the agent can dispatch.
#[async_trait]
pub trait AgentTool: Send + Sync {
    /// The definition offered to the model.
    fn definition(&self) -> ToolDefinition;

    /// Execute with parsed arguments.
    async fn call(&self, arguments: Value) -> Result<Value, AgentError>;
}

/// Process-wide registry of builtin tools, selected per step by name.
#[derive(Default)]
pub struct BuiltinToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn AgentTool>>>,
}

impl BuiltinToolRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builtin tool under its definition name.
    pub fn register(&self, tool: Arc<dyn AgentTool>) {
        self.tools.write().insert(tool.definition().name, tool);
    }

    /// Look up a builtin by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.read().get(name).cloned()
    }

    /// Registered names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.tools.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for BuiltinToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

/// The per-run tool set, in offer order.
#[derive(Default, Clone)]
pub struct ToolCatalog {
    tools: Vec<Arc<dyn AgentTool>>,
    by_name: HashMap<String, usize>,
}

impl ToolCatalog {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool; a duplicate name replaces the earlier entry.
    pub fn push(&mut self, tool: Arc<dyn AgentTool>) {
        let name = tool.definition().name;
        if let Some(&index) = self.by_name.get(&name) {
            self.tools[index] = tool;
        } else {
            self.by_name.insert(name, self.tools.len());
            self.tools.push(tool);
        }
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.by_name.get(name).map(|&index| Arc::clone(&self.tools[index]))
    }

    /// All definitions, in offer order.
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// All definitions except `excluded` (plan phases drop
    /// `switch_to_plan` to prevent recursion).
    #[must_use]
    pub fn definitions_without(&self, excluded: &str) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| t.definition())
            .filter(|d| d.name != excluded)
            .collect()
    }

    /// Number of tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCatalog")
            .field("tools", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Sanitize a tool name for the model-facing catalog.
///
/// ASCII alphanumerics, `_`, and CJK (U+4E00..=U+9FFF) pass through;
/// everything else becomes `_`; an empty result collapses to `unnamed`.
#[must_use]
pub fn sanitize_tool_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || ('\u{4e00}'..='\u{9fff}').contains(&c) {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "unnamed".to_owned()
    } else {
        sanitized
    }
}

/// The `switch_to_plan` escape.
///
/// The runner intercepts calls to it before dispatch; the implementation
/// exists only so the catalog stays uniform.
#[derive(Debug, Default)]
pub struct SwitchToPlanTool;

#[async_trait]
impl AgentTool for SwitchToPlanTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: SWITCH_TO_PLAN.into(),
            description: "Switch to plan mode: break the task into a multi-step plan, \
                          execute the steps, and synthesize an answer. Call this when the \
                          task needs decomposition."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": {"type": "string", "description": "Why plan mode is needed"}
                },
                "required": ["reason"]
            }),
        }
    }

    async fn call(&self, _arguments: Value) -> Result<Value, AgentError> {
        Ok(json!({"status": "switching to plan mode"}))
    }
}

/// Assemble the tool catalog for one agent run.
pub async fn build_catalog(
    config: &AgentConfig,
    ctx: &ExecutionContext,
    step_id: &StepId,
    builtins: &BuiltinToolRegistry,
    provider: &Arc<dyn ChatProvider>,
) -> Result<ToolCatalog, AgentError> {
    let mut catalog = ToolCatalog::new();

    for name in &config.tools {
        match builtins.get(name) {
            Some(tool) => catalog.push(tool),
            None => warn!(tool = %name, "builtin tool not registered, skipping"),
        }
    }

    if !config.mcp_server_ids.is_empty() {
        let proxy_url = config
            .mcp_proxy_url
            .as_deref()
            .ok_or_else(|| AgentError::config("mcp_server_ids set but mcp_proxy_url missing"))?;
        let client = Arc::new(mcp::McpProxyClient::new(proxy_url));
        for server_id in &config.mcp_server_ids {
            for (remote_name, definition) in client.list_tools(server_id).await? {
                catalog.push(Arc::new(mcp::McpTool::new(
                    Arc::clone(&client),
                    server_id.clone(),
                    remote_name,
                    definition,
                )));
            }
        }
    }

    if config.interactive {
        catalog.push(Arc::new(hitl::HumanInteractionTool::new(
            ctx.clone(),
            step_id.clone(),
            config.interaction_timeout(),
        )));
    }

    if !config.knowledge_bases.is_empty() {
        catalog.push(Arc::new(knowledge::KnowledgeSearchTool::new(config)?));
    }

    for spec in &config.skills {
        catalog.push(Arc::new(skill::SkillTool::new(
            Arc::clone(provider),
            spec.clone(),
        )));
    }

    if config.enable_plan_mode {
        catalog.push(Arc::new(SwitchToPlanTool));
    }

    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("calc", "calc")]
    #[case("get weather", "get_weather")]
    #[case("a-b.c", "a_b_c")]
    #[case("查询天气", "查询天气")]
    #[case("查询 weather!", "查询_weather_")]
    #[case("", "unnamed")]
    #[case("???", "___")]
    fn sanitation_table(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(sanitize_tool_name(raw), expected);
    }

    #[test]
    fn catalog_excludes_by_name() {
        let mut catalog = ToolCatalog::new();
        catalog.push(Arc::new(SwitchToPlanTool));
        assert_eq!(catalog.definitions().len(), 1);
        assert!(catalog.definitions_without(SWITCH_TO_PLAN).is_empty());
    }
}
