//! OpenAI-compatible chat-completions client.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::error::AgentError;
use crate::provider::{
    ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChunkSink, Role, TokenUsage, ToolCall,
    ToolDefinition,
};

/// Default endpoint when the config names none.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// A [`ChatProvider`] over any OpenAI-compatible `/v1/chat/completions`
/// endpoint, with SSE streaming.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiProvider {
    /// A provider for `model` at `base_url`.
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            model: model.into(),
        }
    }

    fn request_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(wire_message).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(wire_tool).collect());
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }

    fn builder(&self, body: &Value) -> reqwest::RequestBuilder {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut builder = self.http.post(url).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

fn wire_message(message: &ChatMessage) -> Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut wire = json!({"role": role, "content": message.content});
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = Value::Array(
            message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.arguments},
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    wire
}

fn wire_tool(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        },
    })
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireToolCallFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireToolCallFunction,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Debug, Deserialize)]
struct WireCompletion {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, AgentError> {
        let body = self.request_body(&request, false);
        let response = self.builder(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::provider(format!(
                "chat completion returned {status}: {detail}"
            )));
        }

        let completion: WireCompletion = response
            .json()
            .await
            .map_err(|e| AgentError::Parse(format!("completion body: {e}")))?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::provider("completion had no choices"))?;

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice
                .message
                .tool_calls
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect(),
            usage: completion.usage.map(TokenUsage::from).unwrap_or_default(),
        })
    }

    async fn complete_streaming(
        &self,
        request: ChatRequest,
        on_chunk: ChunkSink<'_>,
    ) -> Result<ChatResponse, AgentError> {
        let body = self.request_body(&request, true);
        let response = self.builder(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::provider(format!(
                "chat completion returned {status}: {detail}"
            )));
        }

        let mut assembled = ChatResponse::default();
        // Tool calls stream as indexed deltas with argument fragments.
        let mut partial_calls: Vec<ToolCall> = Vec::new();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_owned();
                buffer.drain(..=newline);
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    assembled.tool_calls = partial_calls;
                    return Ok(assembled);
                }
                let event: Value = serde_json::from_str(data)
                    .map_err(|e| AgentError::Parse(format!("stream event: {e}")))?;
                apply_stream_event(&event, &mut assembled, &mut partial_calls, on_chunk);
            }
        }

        debug!("stream ended without [DONE]");
        assembled.tool_calls = partial_calls;
        Ok(assembled)
    }
}

fn apply_stream_event(
    event: &Value,
    assembled: &mut ChatResponse,
    partial_calls: &mut Vec<ToolCall>,
    on_chunk: ChunkSink<'_>,
) {
    if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
        if let Ok(usage) = serde_json::from_value::<WireUsage>(usage.clone()) {
            assembled.usage = usage.into();
        }
    }
    let Some(delta) = event
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
    else {
        return;
    };

    if let Some(content) = delta.get("content").and_then(Value::as_str) {
        if !content.is_empty() {
            assembled.content.push_str(content);
            on_chunk(content);
        }
    }

    let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) else {
        return;
    };
    for call in calls {
        let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
        while partial_calls.len() <= index {
            partial_calls.push(ToolCall {
                id: String::new(),
                name: String::new(),
                arguments: String::new(),
            });
        }
        let partial = &mut partial_calls[index];
        if let Some(id) = call.get("id").and_then(Value::as_str) {
            partial.id = id.to_owned();
        }
        if let Some(function) = call.get("function") {
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                partial.name.push_str(name);
            }
            if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                partial.arguments.push_str(arguments);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn one_shot_completion_parses_content_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "hello there"}}],
                "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10},
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(server.uri(), None, "test-model");
        let response = provider.complete(request()).await.unwrap();
        assert_eq!(response.content, "hello there");
        assert_eq!(response.usage.total_tokens, 10);
        assert!(response.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn tool_calls_parse_from_the_wire() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "calc", "arguments": "{\"expr\":\"1+1\"}"},
                    }],
                }}],
            })))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(server.uri(), None, "test-model");
        let response = provider.complete(request()).await.unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "calc");
        assert_eq!(
            response.tool_calls[0].parsed_arguments(),
            json!({"expr": "1+1"})
        );
    }

    #[tokio::test]
    async fn error_status_is_a_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(server.uri(), None, "test-model");
        let err = provider.complete(request()).await.unwrap_err();
        assert!(matches!(err, AgentError::Provider(_)));
    }

    #[tokio::test]
    async fn streaming_assembles_chunks_and_tool_calls() {
        let sse = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Th\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ought\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"calc\",\"arguments\":\"{\\\"e\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"xpr\\\":\\\"1\\\"}\"}}]}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\n\n",
            "data: [DONE]\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&server)
            .await;

        let provider = OpenAiProvider::new(server.uri(), None, "test-model");
        let chunks = parking_lot::Mutex::new(Vec::<String>::new());
        let response = provider
            .complete_streaming(request(), &|chunk| chunks.lock().push(chunk.to_owned()))
            .await
            .unwrap();

        assert_eq!(response.content, "Thought");
        assert_eq!(chunks.lock().as_slice(), ["Th", "ought"]);
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments, "{\"expr\":\"1\"}");
        assert_eq!(response.usage.total_tokens, 6);
    }
}
