//! Pre- and post-step processors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A small unit of work run before or after a step body: variable
/// extraction, assertion, variable assignment, or an inline script.
///
/// The config map is decoded into a typed struct by the processor pipeline
/// at dispatch time; a mismatch is a config error for the owning step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Processor {
    /// Identifier, used in journal entries.
    #[serde(default)]
    pub id: String,
    /// Processor kind: `extract_param`, `set_variable`, `assertion`,
    /// `js_script`.
    #[serde(rename = "type")]
    pub processor_type: String,
    /// Disabled processors are skipped.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Kind-specific configuration.
    #[serde(default)]
    pub config: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

impl Processor {
    /// Create an enabled processor.
    pub fn new(processor_type: impl Into<String>, config: Map<String, Value>) -> Self {
        Self {
            id: String::new(),
            processor_type: processor_type.into(),
            enabled: true,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_defaults_to_true() {
        let p: Processor = serde_json::from_value(serde_json::json!({
            "type": "assertion",
            "config": {"source": "status_code", "operator": "eq", "expected": 200},
        }))
        .unwrap();
        assert!(p.enabled);
        assert_eq!(p.processor_type, "assertion");
    }

    #[test]
    fn disabled_on_the_wire() {
        let p: Processor = serde_json::from_value(serde_json::json!({
            "type": "set_variable",
            "enabled": false,
        }))
        .unwrap();
        assert!(!p.enabled);
    }
}
