//! The `ai` step executor.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use trellis_engine::{EngineError, ExecutionContext, ExecutorRegistry, StepExecutor};
use trellis_workflow::{Step, StepResult};

use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::openai::{DEFAULT_BASE_URL, OpenAiProvider};
use crate::provider::ChatProvider;
use crate::runner::AgentRunner;
use crate::tools::{BuiltinToolRegistry, build_catalog};

/// Hard cap on an AI step with no explicit timeout.
const DEFAULT_AI_TIMEOUT: Duration = Duration::from_secs(300);

/// Builds a provider from a step's agent config.
///
/// The default factory treats every provider as OpenAI-compatible; tests
/// and alternative backends substitute their own.
pub type ProviderFactory =
    Arc<dyn Fn(&AgentConfig) -> Result<Arc<dyn ChatProvider>, AgentError> + Send + Sync>;

/// Executes `ai` steps: one unified ReAct agent per invocation.
pub struct AiExecutor {
    builtins: Arc<BuiltinToolRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    provider_factory: ProviderFactory,
}

impl Default for AiExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl AiExecutor {
    /// An executor with no builtin tools and in-memory checkpoints.
    #[must_use]
    pub fn new() -> Self {
        Self {
            builtins: Arc::new(BuiltinToolRegistry::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            provider_factory: Arc::new(|config: &AgentConfig| {
                let base_url = config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
                Ok(Arc::new(OpenAiProvider::new(
                    base_url,
                    config.api_key.clone(),
                    config.model.clone(),
                )) as Arc<dyn ChatProvider>)
            }),
        }
    }

    /// Use a shared builtin tool registry.
    #[must_use]
    pub fn with_builtins(mut self, builtins: Arc<BuiltinToolRegistry>) -> Self {
        self.builtins = builtins;
        self
    }

    /// Substitute the checkpoint store (e.g. a durable one).
    #[must_use]
    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// Substitute the provider factory (tests use scripted providers).
    #[must_use]
    pub fn with_provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.provider_factory = factory;
        self
    }
}

#[async_trait]
impl StepExecutor for AiExecutor {
    async fn execute(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
    ) -> Result<StepResult, EngineError> {
        let config: AgentConfig = serde_json::from_value(Value::Object(step.config.clone()))
            .map_err(|e| EngineError::config(format!("ai step {}: {e}", step.id)))?;
        let provider = (self.provider_factory)(&config)
            .map_err(|e| EngineError::config(format!("ai step {}: {e}", step.id)))?;

        let catalog = build_catalog(&config, ctx, &step.id, &self.builtins, &provider)
            .await
            .map_err(|e| EngineError::execution(format!("ai step {}: {e}", step.id)))?;

        let deadline = step.timeout.unwrap_or(DEFAULT_AI_TIMEOUT);
        let runner = AgentRunner::new(
            provider,
            catalog,
            config,
            step.id.clone(),
            ctx.clone(),
            Arc::clone(&self.checkpoints),
        );
        let callback = ctx.callback().clone();

        let outcome = tokio::select! {
            () = ctx.cancellation.cancelled() => {
                return Ok(StepResult::skipped(step.id.clone(), "aborted"));
            }
            outcome = tokio::time::timeout(deadline, runner.run()) => outcome,
        };

        match outcome {
            Err(_) => {
                callback
                    .ai_error(&step.id, "agent deadline exceeded")
                    .await;
                Ok(StepResult::timeout(step.id.clone(), deadline))
            }
            Ok(Err(error)) => {
                callback.ai_error(&step.id, &error.to_string()).await;
                Ok(StepResult::failed(step.id.clone(), error.to_string()))
            }
            Ok(Ok(output)) => {
                let usage = output.usage;
                let tool_calls = output.tool_calls.len();
                let value = output.into_value();
                callback.ai_complete(&step.id, &value).await;

                let mut result = StepResult::success(step.id.clone(), value);
                result
                    .metrics
                    .insert("prompt_tokens".into(), usage.prompt_tokens as f64);
                result
                    .metrics
                    .insert("completion_tokens".into(), usage.completion_tokens as f64);
                result
                    .metrics
                    .insert("total_tokens".into(), usage.total_tokens as f64);
                result
                    .metrics
                    .insert("tool_calls".into(), tool_calls as f64);
                Ok(result)
            }
        }
    }
}

impl std::fmt::Debug for AiExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiExecutor")
            .field("builtins", &self.builtins)
            .finish_non_exhaustive()
    }
}

/// Register the AI executor under its conventional tags.
pub fn register(
    registry: &ExecutorRegistry,
    executor: Arc<AiExecutor>,
) -> Result<(), EngineError> {
    registry.register("ai", executor)?;
    registry.alias("agent", "ai")?;
    Ok(())
}
