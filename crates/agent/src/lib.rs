#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Trellis Agent
//!
//! The unified AI step executor: a ReAct loop with concurrent tool
//! dispatch, an agent-initiated Plan mode, a human-in-the-loop tool,
//! knowledge retrieval over vector and graph stores, and sub-agents
//! ("skills") exposed as tools.
//!
//! The executor registers as the `ai` step type. Model access goes through
//! the [`ChatProvider`] trait; [`OpenAiProvider`] speaks any
//! OpenAI-compatible chat-completions endpoint, streaming included.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod executor;
pub mod openai;
pub mod output;
pub mod provider;
pub mod runner;
pub mod tools;

pub use checkpoint::{CheckpointStore, InMemoryCheckpointStore};
pub use config::{AgentConfig, KnowledgeBase, SkillSpec};
pub use error::AgentError;
pub use executor::{AiExecutor, ProviderFactory, register};
pub use openai::OpenAiProvider;
pub use output::{
    AgentMode, AgentTrace, AiOutput, PlanStepStatus, PlanStepTrace, PlanTrace, ReactRound,
    ToolCallRecord,
};
pub use provider::{ChatMessage, ChatProvider, ChatRequest, ChatResponse, Role, TokenUsage, ToolCall, ToolDefinition};
pub use tools::{AgentTool, BuiltinToolRegistry, ToolCatalog, sanitize_tool_name};
