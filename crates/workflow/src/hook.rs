//! Workflow- and step-level hooks.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A hook: an executor invocation guarding a workflow or a step.
///
/// Hooks dispatch through the executor registry exactly like steps, under a
/// synthetic step id. A pre-hook failure skips the guarded entity; post-hook
/// failures are recorded but never change the entity's status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    /// Executor type tag.
    #[serde(rename = "type")]
    pub hook_type: String,
    /// Executor configuration.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl Hook {
    /// Create a hook.
    pub fn new(hook_type: impl Into<String>, config: Map<String, Value>) -> Self {
        Self {
            hook_type: hook_type.into(),
            config,
        }
    }
}
