//! The per-execution journal: the append-only, client-visible log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use trellis_core::StepId;
use trellis_workflow::StepStatus;

use crate::context::VarScope;

/// One journal record.
///
/// The journal is what execution detail views render: variable changes with
/// provenance, assertion outcomes, hook failures, step lifecycle marks, and
/// free-form log lines (script console output lands here).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    /// A variable was written.
    VariableChange {
        /// Variable name.
        name: String,
        /// Previous value (null when unset).
        old_value: Value,
        /// New value.
        new_value: Value,
        /// Temp or env scope.
        scope: VarScope,
        /// What wrote it (processor id, step id, script).
        source: String,
        /// When.
        at: DateTime<Utc>,
    },
    /// An assertion was evaluated.
    Assertion {
        /// The owning step.
        step_id: StepId,
        /// Assertion name.
        name: String,
        /// Whether it held.
        passed: bool,
        /// Detail message.
        message: String,
        /// When.
        at: DateTime<Utc>,
    },
    /// A hook failed.
    HookFailure {
        /// Synthetic hook step id.
        hook_id: StepId,
        /// Failure description.
        message: String,
        /// When.
        at: DateTime<Utc>,
    },
    /// A step began executing.
    StepStarted {
        /// The step.
        step_id: StepId,
        /// When.
        at: DateTime<Utc>,
    },
    /// A step finished.
    StepFinished {
        /// The step.
        step_id: StepId,
        /// Its outcome.
        status: StepStatus,
        /// Retry attempts consumed (1 = no retries).
        attempts: u32,
        /// When.
        at: DateTime<Utc>,
    },
    /// A free-form log line.
    Log {
        /// Origin (step id, processor id).
        source: String,
        /// The line.
        message: String,
        /// When.
        at: DateTime<Utc>,
    },
}

impl JournalEntry {
    /// A variable-change entry stamped now.
    pub fn variable_change(
        name: impl Into<String>,
        old_value: Value,
        new_value: Value,
        scope: VarScope,
        source: impl Into<String>,
    ) -> Self {
        Self::VariableChange {
            name: name.into(),
            old_value,
            new_value,
            scope,
            source: source.into(),
            at: Utc::now(),
        }
    }

    /// A log entry stamped now.
    pub fn log(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Log {
            source: source.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}
