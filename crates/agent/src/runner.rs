//! The agent runner: ReAct loop and plan mode.

use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use trellis_core::StepId;
use trellis_engine::ExecutionContext;
use trellis_expression::resolve_string;

use crate::checkpoint::CheckpointStore;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::output::{
    AgentMode, AgentTrace, AiOutput, PlanStepStatus, PlanStepTrace, PlanTrace, ReactRound,
    ToolCallRecord,
};
use crate::provider::{
    ChatMessage, ChatProvider, ChatRequest, ChatResponse, TokenUsage, ToolCall, ToolDefinition,
};
use crate::tools::{SWITCH_TO_PLAN, ToolCatalog};

const REACT_INSTRUCTION: &str = "Work through the task step by step. Before calling any \
tool, state a short *Thought* explaining what you need and why. Call tools when they \
help; answer directly once you have enough information.";

const PLAN_MODE_INSTRUCTION: &str = "If the task is large or has several independent \
parts, call the `switch_to_plan` tool with a short reason instead of answering; a \
planner will break the task down and execute it step by step.";

const HITL_INSTRUCTION: &str = "When you need a decision, missing detail, or approval \
from the human operator, call the `human_interaction` tool rather than guessing.";

/// Per-step cap for the mini ReAct loops of plan-mode step execution.
const PLAN_STEP_ROUNDS: u32 = 5;

/// One agent invocation: provider, tools, config, and the engine context
/// it reports through.
pub struct AgentRunner {
    provider: Arc<dyn ChatProvider>,
    catalog: ToolCatalog,
    config: AgentConfig,
    step_id: StepId,
    ctx: ExecutionContext,
    checkpoints: Arc<dyn CheckpointStore>,
    chunk_index: Arc<AtomicUsize>,
}

enum LoopOutcome {
    /// The model answered without tool calls.
    Answer { content: String, final_round: u32 },
    /// The model called `switch_to_plan`.
    PlanRequested { reason: String },
}

impl AgentRunner {
    /// Assemble a runner for one step invocation.
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        catalog: ToolCatalog,
        config: AgentConfig,
        step_id: StepId,
        ctx: ExecutionContext,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            provider,
            catalog,
            config,
            step_id,
            ctx,
            checkpoints,
            chunk_index: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Run to a final answer.
    pub async fn run(&self) -> Result<AiOutput, AgentError> {
        let mut messages = self.build_messages();
        let mut usage = TokenUsage::default();
        let mut records = Vec::new();
        let mut react = Vec::new();

        if self.config.force_plan {
            info!(step = %self.step_id, "plan mode forced by configuration");
            return self
                .run_plan("forced", messages, usage, records, react)
                .await;
        }

        let outcome = self
            .react_loop(
                &mut messages,
                self.catalog.definitions(),
                self.config.max_tool_rounds,
                true,
                &mut usage,
                &mut records,
                &mut react,
            )
            .await?;

        match outcome {
            LoopOutcome::PlanRequested { reason } => {
                self.run_plan(&reason, messages, usage, records, react).await
            }
            LoopOutcome::Answer {
                content,
                final_round,
            } => {
                let mode = if final_round == 1 && records.is_empty() {
                    AgentMode::Direct
                } else {
                    AgentMode::React
                };
                Ok(AiOutput {
                    content,
                    usage,
                    tool_calls: records,
                    trace: AgentTrace {
                        mode,
                        react,
                        plan: None,
                    },
                })
            }
        }
    }

    // ── message assembly ───────────────────────────────────────────────

    fn build_messages(&self) -> Vec<ChatMessage> {
        let mut system = String::new();
        if let Some(prompt) = &self.config.system_prompt {
            system.push_str(prompt);
            system.push_str("\n\n");
        }
        system.push_str(REACT_INSTRUCTION);
        if self.config.enable_plan_mode {
            system.push_str("\n\n");
            system.push_str(PLAN_MODE_INSTRUCTION);
        }
        if self.config.interactive {
            system.push_str("\n\n");
            system.push_str(HITL_INSTRUCTION);
        }
        if !self.config.skills.is_empty() {
            system.push_str("\n\nAvailable skills:\n");
            for skill in &self.config.skills {
                system.push_str(&format!(
                    "- {}: {}\n",
                    crate::tools::skill::skill_tool_name(&skill.name),
                    skill.description
                ));
            }
        }

        let mut messages = vec![ChatMessage::system(system)];

        // Chat history, inserted between system and the user message.
        if let Some(Value::Array(history)) = self.ctx.get_variable("__chat_history__") {
            for entry in history {
                let role = entry.get("role").and_then(Value::as_str).unwrap_or("user");
                let content = entry
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match role {
                    "assistant" => messages.push(ChatMessage::assistant(content, Vec::new())),
                    _ => messages.push(ChatMessage::user(content)),
                }
            }
        }

        messages.push(ChatMessage::user(self.user_prompt()));
        messages
    }

    fn user_prompt(&self) -> String {
        if let Some(Value::String(message)) = self.ctx.get_variable("__user_message__") {
            return message;
        }
        resolve_string(&self.ctx.scope(), &self.config.prompt)
    }

    // ── the ReAct loop ─────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn react_loop(
        &self,
        messages: &mut Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
        max_rounds: u32,
        allow_plan: bool,
        usage: &mut TokenUsage,
        records: &mut Vec<ToolCallRecord>,
        react: &mut Vec<ReactRound>,
    ) -> Result<LoopOutcome, AgentError> {
        let max_rounds = max_rounds.max(1);
        for round in 1..=max_rounds {
            let response = self.model_call(messages, tools.clone()).await?;
            usage.merge(response.usage);

            if response.tool_calls.is_empty() {
                return Ok(LoopOutcome::Answer {
                    content: response.content,
                    final_round: round,
                });
            }

            if allow_plan {
                if let Some(call) = response
                    .tool_calls
                    .iter()
                    .find(|call| call.name == SWITCH_TO_PLAN)
                {
                    let reason = call
                        .parsed_arguments()
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("agent requested plan mode")
                        .to_owned();
                    return Ok(LoopOutcome::PlanRequested { reason });
                }
            }

            if !response.content.is_empty() {
                self.ctx
                    .callback()
                    .ai_thinking(&self.step_id, round, &response.content)
                    .await;
            }
            react.push(ReactRound {
                round,
                thought: (!response.content.is_empty()).then(|| response.content.clone()),
                tool_names: response
                    .tool_calls
                    .iter()
                    .map(|call| call.name.clone())
                    .collect(),
            });

            let round_records = self.dispatch_tools(round, &response.tool_calls).await;
            messages.push(ChatMessage::assistant(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            for (call, record) in response.tool_calls.iter().zip(&round_records) {
                messages.push(ChatMessage::tool(call.id.clone(), render_result(record)));
            }
            records.extend(round_records);
        }

        // Round cap: extract a best-effort answer with the tools withdrawn.
        debug!(step = %self.step_id, max_rounds, "tool-round cap reached, extracting answer");
        let response = self.model_call(messages, Vec::new()).await?;
        usage.merge(response.usage);
        Ok(LoopOutcome::Answer {
            content: response.content,
            final_round: max_rounds + 1,
        })
    }

    /// Dispatch one round's tool calls concurrently, preserving call order
    /// in the returned records.
    ///
    /// Events go through the serialized callback handle, so concurrent
    /// calls (and concurrent sibling AI steps) never interleave inside a
    /// handler.
    async fn dispatch_tools(&self, round: u32, calls: &[ToolCall]) -> Vec<ToolCallRecord> {
        let futures = calls.iter().map(|call| {
            let callback = self.ctx.callback().clone();
            let step_id = self.step_id.clone();
            async move {
                let arguments = call.parsed_arguments();
                callback
                    .ai_tool_call_start(&step_id, round, &call.name, &arguments)
                    .await;
                let started = Instant::now();
                let outcome = match self.catalog.get(&call.name) {
                    Some(tool) => tool.call(arguments.clone()).await,
                    None => Err(AgentError::tool(&call.name, "tool not in catalog")),
                };
                let (result, is_error) = match outcome {
                    Ok(value) => (value, false),
                    Err(error) => {
                        warn!(tool = %call.name, %error, "tool call failed");
                        (json!({"error": error.to_string()}), true)
                    }
                };
                callback
                    .ai_tool_call_complete(&step_id, round, &call.name, &result, is_error)
                    .await;
                ToolCallRecord {
                    round,
                    tool_name: call.name.clone(),
                    arguments,
                    result,
                    is_error,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
        });
        futures::future::join_all(futures).await
    }

    // ── plan mode ──────────────────────────────────────────────────────

    async fn run_plan(
        &self,
        reason: &str,
        mut messages: Vec<ChatMessage>,
        mut usage: TokenUsage,
        mut records: Vec<ToolCallRecord>,
        react: Vec<ReactRound>,
    ) -> Result<AiOutput, AgentError> {
        info!(step = %self.step_id, %reason, "entering plan mode");
        let checkpoint_id = format!("plan:{}:{}", self.ctx.execution_id, self.step_id);
        self.checkpoints.set(
            &checkpoint_id,
            serde_json::to_vec(&json!({"reason": reason, "phase": "planning"}))
                .unwrap_or_default(),
        );

        // Plan phase: one model call, JSON plan out.
        messages.push(ChatMessage::user(format!(
            "Break the task into at most {} concrete steps. Respond with ONLY a JSON \
             array of objects like [{{\"step\": 1, \"task\": \"...\"}}]; no prose.",
            self.config.max_plan_steps.max(1)
        )));
        let response = self
            .provider
            .complete(ChatRequest {
                messages: messages.clone(),
                tools: Vec::new(),
            })
            .await?;
        usage.merge(response.usage);

        let mut plan = parse_plan(&response.content)?;
        plan.truncate(self.config.max_plan_steps.max(1));
        if plan.is_empty() {
            return Err(AgentError::Parse("plan phase produced no steps".into()));
        }

        let plan_listing = plan
            .iter()
            .map(|(step, task)| format!("{step}. {task}"))
            .collect::<Vec<_>>()
            .join("\n");
        let mut step_traces: Vec<PlanStepTrace> = plan
            .iter()
            .map(|(step, task)| PlanStepTrace {
                step: *step,
                task: task.clone(),
                status: PlanStepStatus::Pending,
                result: String::new(),
            })
            .collect();

        // Step phase: a bounded mini loop per task, plan escape withdrawn.
        let step_tools = self.catalog.definitions_without(SWITCH_TO_PLAN);
        let system_message = messages
            .first()
            .cloned()
            .unwrap_or_else(|| ChatMessage::system(REACT_INSTRUCTION));
        let original_task = self.user_prompt();

        for index in 0..step_traces.len() {
            let prior = step_traces[..index]
                .iter()
                .map(|t| format!("Step {} ({}): {}", t.step, t.task, t.result))
                .collect::<Vec<_>>()
                .join("\n");
            let current = &step_traces[index];
            let step_prompt = format!(
                "Original task:\n{original_task}\n\nFull plan:\n{plan_listing}\n\n\
                 Completed steps:\n{prior}\n\nYour current task (step {}): {}",
                current.step, current.task
            );

            let mut step_messages =
                vec![system_message.clone(), ChatMessage::user(step_prompt)];
            let outcome = self
                .react_loop(
                    &mut step_messages,
                    step_tools.clone(),
                    PLAN_STEP_ROUNDS,
                    false,
                    &mut usage,
                    &mut records,
                    &mut Vec::new(),
                )
                .await;

            let trace = &mut step_traces[index];
            match outcome {
                Ok(LoopOutcome::Answer { content, .. }) => {
                    trace.status = PlanStepStatus::Completed;
                    trace.result = content;
                }
                Ok(LoopOutcome::PlanRequested { .. }) => {
                    trace.status = PlanStepStatus::Failed;
                    trace.result = "nested plan request rejected".into();
                }
                Err(error) => {
                    warn!(step = %self.step_id, plan_step = trace.step, %error, "plan step failed");
                    trace.status = PlanStepStatus::Failed;
                    trace.result = error.to_string();
                }
            }
            self.checkpoints.set(
                &checkpoint_id,
                serde_json::to_vec(&json!({
                    "reason": reason,
                    "phase": "steps",
                    "completed": index + 1,
                }))
                .unwrap_or_default(),
            );
        }

        // Synthesis phase.
        let results_block = step_traces
            .iter()
            .map(|t| format!("Step {} [{}] {}: {}", t.step, status_word(t.status), t.task, t.result))
            .collect::<Vec<_>>()
            .join("\n");
        let synthesis_prompt = format!(
            "Original task:\n{original_task}\n\nThe plan was executed with these \
             results:\n{results_block}\n\nCompose the final answer to the original task."
        );
        let synthesis_messages = vec![system_message, ChatMessage::user(synthesis_prompt)];
        let response = self.model_call(&synthesis_messages, Vec::new()).await?;
        usage.merge(response.usage);
        self.checkpoints.remove(&checkpoint_id);

        Ok(AiOutput {
            content: response.content.clone(),
            usage,
            tool_calls: records,
            trace: AgentTrace {
                mode: AgentMode::Plan,
                react,
                plan: Some(PlanTrace {
                    reason: reason.to_owned(),
                    steps: step_traces,
                    synthesis: Some(response.content),
                }),
            },
        })
    }

    // ── model invocation ───────────────────────────────────────────────

    async fn model_call(
        &self,
        messages: &[ChatMessage],
        tools: Vec<ToolDefinition>,
    ) -> Result<ChatResponse, AgentError> {
        let request = ChatRequest {
            messages: messages.to_vec(),
            tools,
        };
        if !self.config.streaming {
            return self.provider.complete(request).await;
        }

        // Bridge the provider's sync chunk sink to the async callback.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let forward = {
            let callback = self.ctx.callback().clone();
            let step_id = self.step_id.clone();
            let counter = Arc::clone(&self.chunk_index);
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    let index = counter.fetch_add(1, Ordering::SeqCst);
                    callback.ai_chunk(&step_id, &chunk, index).await;
                }
            })
        };
        let sink = move |chunk: &str| {
            let _ = tx.send(chunk.to_owned());
        };
        let result = self.provider.complete_streaming(request, &sink).await;
        drop(sink);
        let _ = forward.await;
        result
    }
}

fn status_word(status: PlanStepStatus) -> &'static str {
    match status {
        PlanStepStatus::Pending => "pending",
        PlanStepStatus::Completed => "completed",
        PlanStepStatus::Failed => "failed",
    }
}

fn render_result(record: &ToolCallRecord) -> String {
    match &record.result {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct PlanItem {
    #[serde(default)]
    step: Option<u32>,
    task: String,
}

/// Parse the plan-phase output: a JSON array, possibly inside code fences.
fn parse_plan(content: &str) -> Result<Vec<(u32, String)>, AgentError> {
    let start = content
        .find('[')
        .ok_or_else(|| AgentError::Parse(format!("plan output has no JSON array: {content}")))?;
    let end = content
        .rfind(']')
        .filter(|&end| end > start)
        .ok_or_else(|| AgentError::Parse("plan output has an unterminated array".into()))?;
    let items: Vec<PlanItem> = serde_json::from_str(&content[start..=end])
        .map_err(|e| AgentError::Parse(format!("plan JSON: {e}")))?;
    Ok(items
        .into_iter()
        .enumerate()
        .map(|(index, item)| (item.step.unwrap_or(index as u32 + 1), item.task))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_plan_tolerates_code_fences() {
        let content = "Here is the plan:\n```json\n[\n {\"step\": 1, \"task\": \"A\"},\n {\"step\": 2, \"task\": \"B\"}\n]\n```";
        let plan = parse_plan(content).unwrap();
        assert_eq!(plan, vec![(1, "A".to_owned()), (2, "B".to_owned())]);
    }

    #[test]
    fn parse_plan_numbers_unnumbered_items() {
        let plan = parse_plan(r#"[{"task": "first"}, {"task": "second"}]"#).unwrap();
        assert_eq!(plan[0], (1, "first".to_owned()));
        assert_eq!(plan[1], (2, "second".to_owned()));
    }

    #[test]
    fn parse_plan_rejects_proseware() {
        assert!(parse_plan("I cannot plan this").is_err());
    }
}
