//! Agent output and trace types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::provider::TokenUsage;

/// How the agent arrived at its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Answered on round 1 with no tool calls.
    Direct,
    /// One or more ReAct tool rounds.
    React,
    /// The agent escaped into plan mode.
    Plan,
}

/// One recorded tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// The ReAct round (1-based) the call belongs to.
    pub round: u32,
    /// Tool name.
    pub tool_name: String,
    /// Parsed arguments.
    pub arguments: Value,
    /// Tool result (or error payload).
    pub result: Value,
    /// Whether the call failed.
    pub is_error: bool,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

/// One ReAct round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactRound {
    /// Round number, 1-based.
    pub round: u32,
    /// The model's thought preceding the calls, when it emitted one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    /// Names of the tools called this round.
    #[serde(default)]
    pub tool_names: Vec<String>,
}

/// Outcome of one plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    /// Not yet executed.
    Pending,
    /// Finished.
    Completed,
    /// The step-phase run errored.
    Failed,
}

/// One task of the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStepTrace {
    /// Position, 1-based.
    pub step: u32,
    /// Task description from the plan phase.
    pub task: String,
    /// Outcome.
    pub status: PlanStepStatus,
    /// The step's answer.
    #[serde(default)]
    pub result: String,
}

/// The plan-mode record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTrace {
    /// Why the agent switched, from `switch_to_plan(reason)`.
    pub reason: String,
    /// Plan steps in order.
    pub steps: Vec<PlanStepTrace>,
    /// The synthesis-phase answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<String>,
}

/// Structured record of the agent's path to its answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTrace {
    /// Direct, ReAct, or plan.
    pub mode: AgentMode,
    /// ReAct rounds in order.
    #[serde(default)]
    pub react: Vec<ReactRound>,
    /// Plan-mode details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanTrace>,
}

/// The AI step output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiOutput {
    /// The final answer.
    pub content: String,
    /// Accumulated token usage across every model call.
    pub usage: TokenUsage,
    /// Every tool call, in execution order.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    /// How the answer was produced.
    pub trace: AgentTrace,
}

impl AiOutput {
    /// Serialize into a step-result output value.
    #[must_use]
    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
