//! Remote tools served by an MCP proxy.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use crate::error::AgentError;
use crate::provider::ToolDefinition;
use crate::tools::{AgentTool, sanitize_tool_name};

/// Client for the MCP proxy's tool listing and invocation endpoints.
#[derive(Debug)]
pub struct McpProxyClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct WireMcpTool {
    name: String,
    #[serde(default)]
    description: String,
    /// Schemas arrive as `inputSchema` (MCP) or `parameters` (OpenAI-ish).
    #[serde(default, alias = "inputSchema")]
    parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireToolList {
    #[serde(default)]
    tools: Vec<WireMcpTool>,
}

impl McpProxyClient {
    /// A client rooted at the proxy base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// Fetch a server's tool listing as `(remote name, definition)` pairs.
    pub async fn list_tools(
        &self,
        server_id: &str,
    ) -> Result<Vec<(String, ToolDefinition)>, AgentError> {
        let url = format!("{}/servers/{server_id}/tools", self.base_url);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::provider(format!(
                "mcp proxy listing {server_id} returned {status}"
            )));
        }
        let listing: WireToolList = response
            .json()
            .await
            .map_err(|e| AgentError::Parse(format!("mcp tool listing: {e}")))?;

        debug!(server = %server_id, count = listing.tools.len(), "fetched mcp tools");
        Ok(listing
            .tools
            .into_iter()
            .map(|tool| {
                let definition = ToolDefinition {
                    name: sanitize_tool_name(&tool.name),
                    description: tool.description,
                    parameters: tool
                        .parameters
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                };
                (tool.name, definition)
            })
            .collect())
    }

    /// Invoke a remote tool.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, AgentError> {
        let url = format!(
            "{}/servers/{server_id}/tools/{tool_name}/call",
            self.base_url
        );
        let response = self
            .http
            .post(&url)
            .json(&json!({"arguments": arguments}))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::tool(
                tool_name,
                format!("mcp call returned {status}: {detail}"),
            ));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| AgentError::Parse(format!("mcp call result: {e}")))?;
        // Unwrap a `{"result": ...}` envelope when the proxy uses one.
        Ok(body.get("result").cloned().unwrap_or(body))
    }
}

/// One remote tool, bound to its server.
pub struct McpTool {
    client: Arc<McpProxyClient>,
    server_id: String,
    remote_name: String,
    definition: ToolDefinition,
}

impl McpTool {
    /// Bind a listed tool to its proxy client.
    pub fn new(
        client: Arc<McpProxyClient>,
        server_id: impl Into<String>,
        remote_name: impl Into<String>,
        definition: ToolDefinition,
    ) -> Self {
        Self {
            client,
            server_id: server_id.into(),
            remote_name: remote_name.into(),
            definition,
        }
    }
}

#[async_trait]
impl AgentTool for McpTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn call(&self, arguments: Value) -> Result<Value, AgentError> {
        self.client
            .call_tool(&self.server_id, &self.remote_name, arguments)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn listing_sanitizes_names_but_calls_with_remote_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/servers/srv-1/tools"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tools": [{
                    "name": "weather.lookup",
                    "description": "Look up weather",
                    "inputSchema": {"type": "object", "properties": {"city": {"type": "string"}}},
                }],
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/servers/srv-1/tools/weather.lookup/call"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"result": {"temp_c": 21}})),
            )
            .mount(&server)
            .await;

        let client = Arc::new(McpProxyClient::new(server.uri()));
        let listed = client.list_tools("srv-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        let (remote_name, definition) = listed.into_iter().next().unwrap();
        assert_eq!(remote_name, "weather.lookup");
        assert_eq!(definition.name, "weather_lookup");

        let tool = McpTool::new(Arc::clone(&client), "srv-1", remote_name, definition);
        let result = tool.call(json!({"city": "Oslo"})).await.unwrap();
        assert_eq!(result, json!({"temp_c": 21}));
    }

    #[tokio::test]
    async fn failed_call_is_a_tool_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/servers/srv-1/tools/x/call"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = Arc::new(McpProxyClient::new(server.uri()));
        let err = client.call_tool("srv-1", "x", json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::Tool { .. }));
    }
}
