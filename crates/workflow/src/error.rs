//! Workflow model errors.

use thiserror::Error;

use trellis_core::StepId;

use crate::state::ExecutionStatus;

/// Errors raised by workflow validation and state transitions.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The workflow id is empty.
    #[error("workflow id is empty")]
    EmptyWorkflowId,

    /// The workflow has no steps.
    #[error("workflow has no steps")]
    NoSteps,

    /// A step id is empty.
    #[error("step id is empty")]
    EmptyStepId,

    /// Two steps share an id.
    #[error("duplicate step id: {0}")]
    DuplicateStepId(StepId),

    /// A step declares more than one body form.
    #[error("step {0} declares more than one of children, parallel, loop")]
    AmbiguousBody(StepId),

    /// A leaf step has no executor type.
    #[error("step {0} is a leaf but has no type")]
    MissingStepType(StepId),

    /// A loop spec is inconsistent.
    #[error("invalid loop on step {step_id}: {reason}")]
    InvalidLoop {
        /// The owning step.
        step_id: StepId,
        /// What is wrong.
        reason: String,
    },

    /// An option value is out of range.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// A state transition is not in the execution state machine.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: ExecutionStatus,
        /// Attempted target status.
        to: ExecutionStatus,
    },
}
