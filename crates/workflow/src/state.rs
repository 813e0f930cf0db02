//! Execution status and state tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use trellis_core::{ExecutionId, SlaveId, StepId, WorkflowId};

use crate::error::WorkflowError;
use crate::result::StepStatus;

/// The overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Accepted but not yet running.
    Pending,
    /// Actively executing steps.
    Running,
    /// Held at a step boundary by a pause command.
    Paused,
    /// All steps finished without failures.
    Completed,
    /// At least one step failed or timed out.
    Failed,
    /// Stopped by a stop command before completion.
    Aborted,
}

impl ExecutionStatus {
    /// Returns `true` if the execution has reached a final state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Returns `true` while the execution holds resources.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Whether moving to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Aborted)
                | (Self::Running, Self::Paused)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Aborted)
                | (Self::Paused, Self::Running)
                | (Self::Paused, Self::Aborted)
                // A pause request can land after the final step started; the
                // execution still finishes.
                | (Self::Paused, Self::Completed)
                | (Self::Paused, Self::Failed)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Machine-readable classification for recorded errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed or missing step/hook/processor config.
    Config,
    /// Bad request from an API client.
    Validation,
    /// A step body failed.
    Execution,
    /// A deadline was exceeded.
    Timeout,
    /// HTTP/channel plumbing failed.
    Transport,
    /// Expression parse or evaluation failed.
    Expression,
    /// A `${...}` reference did not resolve.
    VariableNotFound,
    /// A hook failed.
    Hook,
    /// An AI tool call failed.
    Tool,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Expression => "expression",
            Self::VariableNotFound => "variable_not_found",
            Self::Hook => "hook",
            Self::Tool => "tool",
        };
        f.write_str(name)
    }
}

/// One recorded error in an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Classification.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// The step involved, when one is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
}

impl ErrorEntry {
    /// Record an error now.
    pub fn new(code: ErrorCode, message: impl Into<String>, step_id: Option<StepId>) -> Self {
        Self {
            code,
            message: message.into(),
            step_id,
            timestamp: Utc::now(),
        }
    }
}

/// Per-slave progress within a distributed execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlaveExecutionState {
    /// Tasks this slave finished successfully.
    pub completed_tasks: u64,
    /// Tasks this slave reported as failed.
    pub failed_tasks: u64,
    /// Slave-reported progress in `[0, 1]`.
    pub progress: f64,
    /// When the slave last reported.
    pub last_update: DateTime<Utc>,
}

/// The live state of one execution.
///
/// Mutated only by the kernel (or the coordinator for slave counters);
/// everything else reads snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    /// Execution identifier.
    pub id: ExecutionId,
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// Current status.
    pub status: ExecutionStatus,
    /// Progress in `[0, 1]`, non-decreasing, `1.0` exactly at terminal.
    pub progress: f64,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Per-slave progress for distributed runs.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub slave_states: HashMap<SlaveId, SlaveExecutionState>,
    /// Recorded errors, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorEntry>,
    /// Total leaf steps planned.
    pub total_steps: u64,
    /// Leaves that succeeded.
    pub success_steps: u64,
    /// Leaves that failed or timed out.
    pub failed_steps: u64,
    /// Leaves that were skipped.
    pub skipped_steps: u64,
}

impl ExecutionState {
    /// A fresh pending state.
    pub fn new(id: ExecutionId, workflow_id: WorkflowId, total_steps: u64) -> Self {
        Self {
            id,
            workflow_id,
            status: ExecutionStatus::Pending,
            progress: 0.0,
            started_at: Utc::now(),
            ended_at: None,
            slave_states: HashMap::new(),
            errors: Vec::new(),
            total_steps,
            success_steps: 0,
            failed_steps: 0,
            skipped_steps: 0,
        }
    }

    /// Transition to `next`, rejecting moves outside the state machine.
    pub fn transition_to(&mut self, next: ExecutionStatus) -> Result<(), WorkflowError> {
        if !self.status.can_transition_to(next) {
            return Err(WorkflowError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
            self.progress = 1.0;
        }
        Ok(())
    }

    /// Fold a finished step into the counters.
    pub fn record_step(&mut self, status: StepStatus) {
        match status {
            StepStatus::Success => self.success_steps += 1,
            StepStatus::Failed | StepStatus::Timeout => self.failed_steps += 1,
            StepStatus::Skipped => self.skipped_steps += 1,
        }
    }

    /// Advance progress; regressions are ignored so it stays monotone.
    pub fn advance_progress(&mut self, progress: f64) {
        if progress > self.progress {
            self.progress = progress.min(1.0);
        }
    }

    /// Append an error.
    pub fn push_error(&mut self, entry: ErrorEntry) {
        self.errors.push(entry);
    }

    /// Steps finished so far.
    #[must_use]
    pub fn finished_steps(&self) -> u64 {
        self.success_steps + self.failed_steps + self.skipped_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn state() -> ExecutionState {
        ExecutionState::new(ExecutionId::v4(), WorkflowId::new("wf"), 4)
    }

    #[rstest]
    #[case(ExecutionStatus::Pending, ExecutionStatus::Running, true)]
    #[case(ExecutionStatus::Running, ExecutionStatus::Paused, true)]
    #[case(ExecutionStatus::Paused, ExecutionStatus::Running, true)]
    #[case(ExecutionStatus::Running, ExecutionStatus::Completed, true)]
    #[case(ExecutionStatus::Running, ExecutionStatus::Aborted, true)]
    #[case(ExecutionStatus::Completed, ExecutionStatus::Running, false)]
    #[case(ExecutionStatus::Paused, ExecutionStatus::Completed, true)]
    #[case(ExecutionStatus::Pending, ExecutionStatus::Paused, false)]
    fn transition_table(
        #[case] from: ExecutionStatus,
        #[case] to: ExecutionStatus,
        #[case] legal: bool,
    ) {
        assert_eq!(from.can_transition_to(to), legal);
    }

    #[test]
    fn terminal_states() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Aborted.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
    }

    #[test]
    fn terminal_transition_pins_progress_to_one() {
        let mut state = state();
        state.transition_to(ExecutionStatus::Running).unwrap();
        state.advance_progress(0.5);
        state.transition_to(ExecutionStatus::Completed).unwrap();
        assert_eq!(state.progress, 1.0);
        assert!(state.ended_at.is_some());
    }

    #[test]
    fn illegal_transition_rejected() {
        let mut state = state();
        let err = state.transition_to(ExecutionStatus::Paused).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
        assert_eq!(state.status, ExecutionStatus::Pending);
    }

    #[test]
    fn progress_is_monotone() {
        let mut state = state();
        state.advance_progress(0.5);
        state.advance_progress(0.25);
        assert_eq!(state.progress, 0.5);
        state.advance_progress(2.0);
        assert_eq!(state.progress, 1.0);
    }

    #[test]
    fn step_counters_partition_totals() {
        let mut state = state();
        state.record_step(StepStatus::Success);
        state.record_step(StepStatus::Failed);
        state.record_step(StepStatus::Skipped);
        state.record_step(StepStatus::Timeout);
        assert_eq!(state.success_steps, 1);
        assert_eq!(state.failed_steps, 2);
        assert_eq!(state.skipped_steps, 1);
        assert_eq!(state.finished_steps(), 4);
    }

    #[test]
    fn status_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::Aborted).unwrap(),
            "\"aborted\""
        );
    }
}
