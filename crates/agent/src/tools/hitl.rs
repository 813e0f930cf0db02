//! The human-in-the-loop tool.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::info;

use trellis_core::StepId;
use trellis_engine::{ExecutionContext, InteractionRequest};

use crate::error::AgentError;
use crate::provider::ToolDefinition;
use crate::tools::AgentTool;

/// Name of the human-interaction tool.
pub const HUMAN_INTERACTION: &str = "human_interaction";

#[derive(Debug, Deserialize)]
struct InteractionArgs {
    /// `confirm`, `input`, or `select`.
    #[serde(rename = "type")]
    kind: String,
    prompt: String,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    default_value: Option<Value>,
}

/// Blocks the agent until a human answers (or the timeout elapses, in
/// which case the default value is returned with `skipped: true`).
///
/// The pending question travels through `on_ai_interaction_required`; the
/// answer arrives via the control surface's interaction endpoint.
pub struct HumanInteractionTool {
    ctx: ExecutionContext,
    step_id: StepId,
    timeout: Duration,
}

impl HumanInteractionTool {
    /// Build the tool for one agent run.
    pub fn new(ctx: ExecutionContext, step_id: StepId, timeout: Duration) -> Self {
        Self {
            ctx,
            step_id,
            timeout,
        }
    }
}

#[async_trait]
impl AgentTool for HumanInteractionTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: HUMAN_INTERACTION.into(),
            description: "Ask the human operator a question and wait for the answer. \
                          Use `confirm` for yes/no, `input` for free text, `select` to \
                          choose among options."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "type": {"type": "string", "enum": ["confirm", "input", "select"]},
                    "prompt": {"type": "string"},
                    "options": {"type": "array", "items": {"type": "string"}},
                    "default_value": {"description": "Returned when the human does not answer in time"}
                },
                "required": ["type", "prompt"]
            }),
        }
    }

    async fn call(&self, arguments: Value) -> Result<Value, AgentError> {
        let args: InteractionArgs = serde_json::from_value(arguments)
            .map_err(|e| AgentError::tool(HUMAN_INTERACTION, format!("bad arguments: {e}")))?;
        if !matches!(args.kind.as_str(), "confirm" | "input" | "select") {
            return Err(AgentError::tool(
                HUMAN_INTERACTION,
                format!("unknown interaction type: {}", args.kind),
            ));
        }

        let interaction_id = uuid::Uuid::new_v4().to_string();
        let receiver = self.ctx.register_interaction(&interaction_id);
        let request = InteractionRequest {
            id: interaction_id.clone(),
            step_id: self.step_id.clone(),
            kind: args.kind,
            prompt: args.prompt,
            options: args.options,
            default_value: args.default_value.clone(),
        };
        self.ctx.callback().interaction_required(&request).await;
        info!(interaction = %interaction_id, step = %self.step_id, "waiting for human response");

        tokio::select! {
            answer = receiver => match answer {
                Ok(value) => Ok(json!({"skipped": false, "value": value})),
                Err(_) => {
                    // The surface dropped the sender (execution stopping).
                    Ok(json!({"skipped": true, "value": args.default_value}))
                }
            },
            () = tokio::time::sleep(self.timeout) => {
                self.ctx.cancel_interaction(&interaction_id);
                info!(interaction = %interaction_id, "interaction timed out, using default");
                Ok(json!({"skipped": true, "value": args.default_value}))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use trellis_core::ExecutionId;
    use trellis_engine::NoopCallback;
    use trellis_engine::callback::CallbackHandle;

    fn tool(timeout: Duration) -> (HumanInteractionTool, ExecutionContext) {
        let ctx = ExecutionContext::new(
            ExecutionId::v4(),
            serde_json::Map::new(),
            CallbackHandle::new(Arc::new(NoopCallback)),
            CancellationToken::new(),
        );
        (
            HumanInteractionTool::new(ctx.clone(), StepId::new("ask"), timeout),
            ctx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_returns_default_with_skipped_flag() {
        let (tool, _ctx) = tool(Duration::from_secs(2));
        let result = tool
            .call(json!({"type": "confirm", "prompt": "deploy?", "default_value": false}))
            .await
            .unwrap();
        assert_eq!(result, json!({"skipped": true, "value": false}));
    }

    #[tokio::test]
    async fn response_resolves_the_wait() {
        let (tool, ctx) = tool(Duration::from_secs(300));
        let call = tokio::spawn(async move {
            tool.call(json!({"type": "input", "prompt": "name?"})).await
        });

        // Wait until the interaction is registered, then answer it.
        let mut answered = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if let Some(id) = ctx.pending_interactions().first() {
                assert!(ctx.respond_interaction(id, json!("ada")));
                answered = true;
                break;
            }
        }
        assert!(answered);

        let result = call.await.unwrap().unwrap();
        assert_eq!(result, json!({"skipped": false, "value": "ada"}));
    }

    #[tokio::test]
    async fn unknown_kind_is_a_tool_error() {
        let (tool, _ctx) = tool(Duration::from_secs(1));
        let err = tool
            .call(json!({"type": "telepathy", "prompt": "?"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Tool { .. }));
    }
}
