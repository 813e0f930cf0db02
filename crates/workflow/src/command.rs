//! Control commands targeting a live execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use trellis_core::ExecutionId;

/// Kinds of control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Retarget the virtual-user count (performance mode only).
    Scale,
    /// Hold at the next step boundary.
    Pause,
    /// Release a paused execution.
    Resume,
    /// Cancel the execution.
    Stop,
}

/// A command routed to whichever node runs the execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCommand {
    /// What to do.
    #[serde(rename = "type")]
    pub kind: CommandKind,
    /// The execution to act on.
    pub execution_id: ExecutionId,
    /// Command parameters, e.g. `target_vus` for scale.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, Value>,
}

impl ControlCommand {
    /// A command with no parameters.
    #[must_use]
    pub fn new(kind: CommandKind, execution_id: ExecutionId) -> Self {
        Self {
            kind,
            execution_id,
            params: HashMap::new(),
        }
    }

    /// A scale command targeting `target_vus`.
    #[must_use]
    pub fn scale(execution_id: ExecutionId, target_vus: u32) -> Self {
        let mut command = Self::new(CommandKind::Scale, execution_id);
        command
            .params
            .insert("target_vus".into(), Value::from(target_vus));
        command
    }

    /// The `target_vus` parameter, when present and numeric.
    #[must_use]
    pub fn target_vus(&self) -> Option<u32> {
        self.params
            .get("target_vus")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn scale_roundtrip() {
        let command = ControlCommand::scale(ExecutionId::v4(), 25);
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["type"], "scale");
        let back: ControlCommand = serde_json::from_value(json).unwrap();
        assert_eq!(back.target_vus(), Some(25));
    }

    #[test]
    fn pause_has_no_params() {
        let command = ControlCommand::new(CommandKind::Pause, ExecutionId::v4());
        let json = serde_json::to_value(&command).unwrap();
        assert!(json.get("params").is_none());
    }
}
