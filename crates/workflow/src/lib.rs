#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Trellis Workflow
//!
//! The data model of the Trellis engine: workflow definitions, the step
//! tree, processors and hooks, retry policies, step results with their typed
//! outputs, the execution state machine, and control commands.
//!
//! This crate models definitions and state — it contains no execution
//! logic. A [`Workflow`] is immutable once submitted; [`ExecutionState`] is
//! mutated only by the kernel and read concurrently by everything else.

pub mod command;
pub mod error;
pub mod hook;
pub mod processor;
pub mod result;
pub mod retry;
pub mod state;
pub mod step;
pub mod workflow;

pub use command::{CommandKind, ControlCommand};
pub use error::WorkflowError;
pub use hook::Hook;
pub use processor::Processor;
pub use result::{
    ActualRequest, AssertionResult, HttpResponseData, ScriptOutput, StepResult, StepStatus,
};
pub use retry::{Backoff, RetryPolicy};
pub use state::{ErrorCode, ErrorEntry, ExecutionState, ExecutionStatus, SlaveExecutionState};
pub use step::{LoopSpec, ParallelGroup, Step, StepBody};
pub use workflow::{ExecutionMode, Stage, Workflow, WorkflowOptions};
