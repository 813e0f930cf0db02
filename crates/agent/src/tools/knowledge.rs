//! Knowledge retrieval over vector and graph stores.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::{AgentConfig, KnowledgeBase};
use crate::error::AgentError;
use crate::provider::ToolDefinition;
use crate::tools::AgentTool;

/// Name of the knowledge-search tool.
pub const KNOWLEDGE_SEARCH: &str = "knowledge_search";

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Debug)]
struct Hit {
    score: f64,
    content: String,
    source: String,
}

/// Searches every configured knowledge base and renders the merged hits as
/// a context block the model can cite.
///
/// Vector KBs: the query is embedded via an OpenAI-compatible
/// `/v1/embeddings` endpoint and searched in their Qdrant collection.
/// Graph KBs: the query goes to the graph search endpoint with
/// `retrieval_mode: "graph"`.
pub struct KnowledgeSearchTool {
    http: reqwest::Client,
    embedding_url: String,
    embedding_model: String,
    embedding_api_key: Option<String>,
    qdrant_host: Option<String>,
    graph_search_url: Option<String>,
    score_threshold: f64,
    default_top_k: usize,
    knowledge_bases: Vec<KnowledgeBase>,
}

impl KnowledgeSearchTool {
    /// Build the tool from the agent config.
    pub fn new(config: &AgentConfig) -> Result<Self, AgentError> {
        let embedding_url = config
            .embedding_url
            .clone()
            .ok_or_else(|| AgentError::config("knowledge_bases set but embedding_url missing"))?;
        Ok(Self {
            http: reqwest::Client::new(),
            embedding_url: embedding_url.trim_end_matches('/').to_owned(),
            embedding_model: config
                .embedding_model
                .clone()
                .unwrap_or_else(|| "text-embedding-3-small".to_owned()),
            embedding_api_key: config.api_key.clone(),
            qdrant_host: config
                .qdrant_host
                .as_ref()
                .map(|h| h.trim_end_matches('/').to_owned()),
            graph_search_url: config.graph_search_url.clone(),
            score_threshold: config.score_threshold.unwrap_or(0.0),
            default_top_k: config.top_k,
            knowledge_bases: config.knowledge_bases.clone(),
        })
    }

    async fn embed(&self, query: &str) -> Result<Vec<f64>, AgentError> {
        let url = format!("{}/v1/embeddings", self.embedding_url);
        let mut request = self.http.post(&url).json(&json!({
            "model": self.embedding_model,
            "input": [query],
        }));
        if let Some(key) = &self.embedding_api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::provider(format!(
                "embeddings endpoint returned {status}"
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| AgentError::Parse(format!("embeddings body: {e}")))?;
        let vector = body["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| AgentError::Parse("embeddings body missing data[0].embedding".into()))?
            .iter()
            .filter_map(Value::as_f64)
            .collect();
        Ok(vector)
    }

    async fn search_vector(
        &self,
        kb: &KnowledgeBase,
        collection: &str,
        vector: &[f64],
        top_k: usize,
    ) -> Result<Vec<Hit>, AgentError> {
        let Some(host) = &self.qdrant_host else {
            return Err(AgentError::config("vector knowledge base but qdrant_host missing"));
        };
        let url = format!("{host}/collections/{collection}/points/query");
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "query": vector,
                "limit": top_k,
                "score_threshold": self.score_threshold,
                "with_payload": true,
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::provider(format!(
                "qdrant query on {collection} returned {status}"
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| AgentError::Parse(format!("qdrant body: {e}")))?;
        let points = body["result"]["points"]
            .as_array()
            .or_else(|| body["result"].as_array())
            .cloned()
            .unwrap_or_default();

        Ok(points
            .iter()
            .map(|point| Hit {
                score: point["score"].as_f64().unwrap_or(0.0),
                content: payload_text(&point["payload"]),
                source: kb.id.clone(),
            })
            .collect())
    }

    async fn search_graph(
        &self,
        kb: &KnowledgeBase,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<Hit>, AgentError> {
        let Some(url) = &self.graph_search_url else {
            return Err(AgentError::config("graph knowledge base but graph_search_url missing"));
        };
        let response = self
            .http
            .post(url)
            .json(&json!({
                "query": query,
                "kb_id": kb.id,
                "retrieval_mode": "graph",
                "limit": top_k,
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::provider(format!(
                "graph search returned {status}"
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| AgentError::Parse(format!("graph search body: {e}")))?;
        Ok(body["results"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(|result| Hit {
                score: result["score"].as_f64().unwrap_or(0.0),
                content: result["content"]
                    .as_str()
                    .unwrap_or_default()
                    .to_owned(),
                source: kb.id.clone(),
            })
            .collect())
    }
}

fn payload_text(payload: &Value) -> String {
    for key in ["content", "text", "chunk"] {
        if let Some(text) = payload.get(key).and_then(Value::as_str) {
            return text.to_owned();
        }
    }
    payload.to_string()
}

#[async_trait]
impl AgentTool for KnowledgeSearchTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: KNOWLEDGE_SEARCH.into(),
            description: "Search the configured knowledge bases for passages relevant to \
                          a query. Returns the best-scoring passages as context."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "top_k": {"type": "integer", "minimum": 1}
                },
                "required": ["query"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> Result<Value, AgentError> {
        let args: SearchArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentError::tool(KNOWLEDGE_SEARCH, format!("bad arguments: {e}")))?;
        let top_k = args.top_k.unwrap_or(self.default_top_k).max(1);

        // Embed once; vector KBs share the query vector.
        let needs_vector = self
            .knowledge_bases
            .iter()
            .any(|kb| kb.kb_type != "graph");
        let vector = if needs_vector {
            Some(self.embed(&args.query).await?)
        } else {
            None
        };

        let mut hits: Vec<Hit> = Vec::new();
        for kb in &self.knowledge_bases {
            let result = if kb.kb_type == "graph" {
                self.search_graph(kb, &args.query, top_k).await
            } else if let Some(collection) = &kb.qdrant_collection {
                let vector = vector.as_deref().unwrap_or(&[]);
                self.search_vector(kb, collection, vector, top_k).await
            } else {
                debug!(kb = %kb.id, "knowledge base has no collection, skipping");
                continue;
            };
            match result {
                Ok(mut kb_hits) => hits.append(&mut kb_hits),
                // One unreachable store must not kill the whole search.
                Err(error) => warn!(kb = %kb.id, %error, "knowledge base search failed"),
            }
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);

        let context = hits
            .iter()
            .enumerate()
            .map(|(index, hit)| {
                format!(
                    "[{}] (score {:.3}, source {}) {}",
                    index + 1,
                    hit.score,
                    hit.source,
                    hit.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(json!({
            "results": hits.iter().map(|h| json!({
                "score": h.score,
                "content": h.content,
                "source": h.source,
            })).collect::<Vec<_>>(),
            "context": context,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(embedding: &str, qdrant: &str, graph: &str) -> AgentConfig {
        serde_json::from_value(json!({
            "model": "m",
            "embedding_url": embedding,
            "qdrant_host": qdrant,
            "graph_search_url": format!("{graph}/search"),
            "score_threshold": 0.2,
            "knowledge_bases": [
                {"id": "docs", "type": "vector", "qdrantCollection": "docs"},
                {"id": "wiki", "type": "graph"},
            ],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn merges_sorts_and_truncates_across_sources() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.1, 0.2, 0.3]}],
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/collections/docs/points/query"))
            .and(body_partial_json(json!({"with_payload": true, "limit": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {"points": [
                    {"score": 0.9, "payload": {"content": "vector hit"}},
                    {"score": 0.3, "payload": {"content": "weak vector hit"}},
                ]},
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_partial_json(json!({"retrieval_mode": "graph"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"score": 0.7, "content": "graph hit"}],
            })))
            .mount(&server)
            .await;

        let uri = server.uri();
        let tool = KnowledgeSearchTool::new(&config(&uri, &uri, &uri)).unwrap();
        let result = tool
            .call(json!({"query": "what is trellis", "top_k": 2}))
            .await
            .unwrap();

        let results = result["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["content"], "vector hit");
        assert_eq!(results[1]["content"], "graph hit");
        let context = result["context"].as_str().unwrap();
        assert!(context.starts_with("[1] (score 0.900, source docs) vector hit"));
    }

    #[tokio::test]
    async fn missing_embedding_url_is_config_error() {
        let config: AgentConfig = serde_json::from_value(json!({
            "model": "m",
            "knowledge_bases": [{"id": "docs", "type": "vector", "qdrantCollection": "c"}],
        }))
        .unwrap();
        assert!(matches!(
            KnowledgeSearchTool::new(&config),
            Err(AgentError::Config(_))
        ));
    }
}
