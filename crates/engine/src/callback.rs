//! Execution callbacks.
//!
//! The kernel reports progress through an [`ExecutionCallback`]; API layers
//! implement it to stream SSE events, collect summaries, or feed the AI
//! event surface. Callback invocations are serialized per execution by
//! [`CallbackHandle`], so implementations never see interleaved events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use trellis_core::{ExecutionId, StepId};
use trellis_workflow::{ExecutionState, StepResult};

/// A pending human-in-the-loop request surfaced by an AI step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionRequest {
    /// Correlation id; responses reference it.
    pub id: String,
    /// The step waiting on the interaction.
    pub step_id: StepId,
    /// `confirm`, `input`, or `select`.
    pub kind: String,
    /// The question shown to the human.
    pub prompt: String,
    /// Choices for `select`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Fallback applied on timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

/// Observer of one execution's lifecycle.
///
/// Every method has a no-op default; implement what you need. AI steps emit
/// the extended `on_ai_*` family between their step start/complete marks.
#[allow(unused_variables)]
#[async_trait]
pub trait ExecutionCallback: Send + Sync {
    /// A step is about to run.
    async fn on_step_start(&self, execution_id: ExecutionId, step_id: &StepId) {}

    /// A step finished (success, failure, or timeout).
    async fn on_step_complete(&self, execution_id: ExecutionId, result: &StepResult) {}

    /// A step was skipped (condition false, hook failure, abort).
    async fn on_step_skipped(&self, execution_id: ExecutionId, step_id: &StepId, reason: &str) {}

    /// Overall progress moved.
    async fn on_progress(&self, execution_id: ExecutionId, progress: f64) {}

    /// The execution reached a terminal state.
    async fn on_execution_complete(&self, state: &ExecutionState) {}

    /// Streamed content chunk from an AI step.
    async fn on_ai_chunk(&self, step_id: &StepId, chunk: &str, index: usize) {}

    /// A ReAct thought preceding tool calls.
    async fn on_ai_thinking(&self, step_id: &StepId, round: u32, thought: &str) {}

    /// A tool call started.
    async fn on_ai_tool_call_start(&self, step_id: &StepId, round: u32, tool: &str, args: &Value) {}

    /// A tool call finished.
    async fn on_ai_tool_call_complete(
        &self,
        step_id: &StepId,
        round: u32,
        tool: &str,
        result: &Value,
        is_error: bool,
    ) {
    }

    /// The AI step produced its final output.
    async fn on_ai_complete(&self, step_id: &StepId, output: &Value) {}

    /// The AI step failed; replaces `on_ai_complete`.
    async fn on_ai_error(&self, step_id: &StepId, error: &str) {}

    /// An AI step is blocked on a human response.
    async fn on_ai_interaction_required(&self, request: &InteractionRequest) {}
}

/// A callback that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallback;

#[async_trait]
impl ExecutionCallback for NoopCallback {}

/// Serializes callback invocations for one execution.
///
/// One handler runs at a time per execution, so parallel branches cannot
/// interleave their events (§ ordering guarantees).
#[derive(Clone)]
pub struct CallbackHandle {
    callback: Arc<dyn ExecutionCallback>,
    guard: Arc<tokio::sync::Mutex<()>>,
}

impl CallbackHandle {
    /// Wrap a callback.
    pub fn new(callback: Arc<dyn ExecutionCallback>) -> Self {
        Self {
            callback,
            guard: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// See [`ExecutionCallback::on_step_start`].
    pub async fn step_start(&self, execution_id: ExecutionId, step_id: &StepId) {
        let _serialized = self.guard.lock().await;
        self.callback.on_step_start(execution_id, step_id).await;
    }

    /// See [`ExecutionCallback::on_step_complete`].
    pub async fn step_complete(&self, execution_id: ExecutionId, result: &StepResult) {
        let _serialized = self.guard.lock().await;
        self.callback.on_step_complete(execution_id, result).await;
    }

    /// See [`ExecutionCallback::on_step_skipped`].
    pub async fn step_skipped(&self, execution_id: ExecutionId, step_id: &StepId, reason: &str) {
        let _serialized = self.guard.lock().await;
        self.callback
            .on_step_skipped(execution_id, step_id, reason)
            .await;
    }

    /// See [`ExecutionCallback::on_progress`].
    pub async fn progress(&self, execution_id: ExecutionId, progress: f64) {
        let _serialized = self.guard.lock().await;
        self.callback.on_progress(execution_id, progress).await;
    }

    /// See [`ExecutionCallback::on_execution_complete`].
    pub async fn execution_complete(&self, state: &ExecutionState) {
        let _serialized = self.guard.lock().await;
        self.callback.on_execution_complete(state).await;
    }

    /// See [`ExecutionCallback::on_ai_interaction_required`].
    pub async fn interaction_required(&self, request: &InteractionRequest) {
        let _serialized = self.guard.lock().await;
        self.callback.on_ai_interaction_required(request).await;
    }

    /// See [`ExecutionCallback::on_ai_chunk`].
    pub async fn ai_chunk(&self, step_id: &StepId, chunk: &str, index: usize) {
        let _serialized = self.guard.lock().await;
        self.callback.on_ai_chunk(step_id, chunk, index).await;
    }

    /// See [`ExecutionCallback::on_ai_thinking`].
    pub async fn ai_thinking(&self, step_id: &StepId, round: u32, thought: &str) {
        let _serialized = self.guard.lock().await;
        self.callback.on_ai_thinking(step_id, round, thought).await;
    }

    /// See [`ExecutionCallback::on_ai_tool_call_start`].
    pub async fn ai_tool_call_start(&self, step_id: &StepId, round: u32, tool: &str, args: &Value) {
        let _serialized = self.guard.lock().await;
        self.callback
            .on_ai_tool_call_start(step_id, round, tool, args)
            .await;
    }

    /// See [`ExecutionCallback::on_ai_tool_call_complete`].
    pub async fn ai_tool_call_complete(
        &self,
        step_id: &StepId,
        round: u32,
        tool: &str,
        result: &Value,
        is_error: bool,
    ) {
        let _serialized = self.guard.lock().await;
        self.callback
            .on_ai_tool_call_complete(step_id, round, tool, result, is_error)
            .await;
    }

    /// See [`ExecutionCallback::on_ai_complete`].
    pub async fn ai_complete(&self, step_id: &StepId, output: &Value) {
        let _serialized = self.guard.lock().await;
        self.callback.on_ai_complete(step_id, output).await;
    }

    /// See [`ExecutionCallback::on_ai_error`].
    pub async fn ai_error(&self, step_id: &StepId, error: &str) {
        let _serialized = self.guard.lock().await;
        self.callback.on_ai_error(step_id, error).await;
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").finish_non_exhaustive()
    }
}
