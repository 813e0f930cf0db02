//! Strongly-typed identifiers for Trellis entities.
//!
//! Runtime-generated identifiers use [`domain-key`](https://crates.io/crates/domain-key)
//! `Uuid<D>` wrappers: `Copy`, 16 bytes, with `v4()` / `nil()` / `parse()`,
//! full serde support, `Display`, `FromStr`, `Eq`, `Ord`, `Hash`.
//!
//! Client-supplied identifiers are string newtypes. A workflow author picks
//! step ids; a slave deployment may pick its own node id. These carry the
//! string verbatim and serialize transparently.

use serde::{Deserialize, Serialize};

use domain_key::define_uuid;

// Re-export for downstream parse error handling
pub use domain_key::UuidParseError;

// Runtime identifiers — UUID-based, Copy, 16 bytes each
define_uuid!(pub ExecutionIdDomain => ExecutionId);
define_uuid!(pub TaskIdDomain => TaskId);

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an identifier string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// The identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns `true` if the identifier is the empty string.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Identifier of a workflow, chosen by the submitting client.
    WorkflowId
}

string_id! {
    /// Identifier of a step, unique within its workflow tree.
    StepId
}

string_id! {
    /// Identifier of a registered slave node.
    SlaveId
}

impl StepId {
    /// The id of this step within loop iteration `index`.
    ///
    /// Loop bodies re-run the same steps; suffixing the iteration keeps
    /// result ids a stable path (`fetch[0]`, `fetch[1]`, ...).
    #[must_use]
    pub fn iteration(&self, index: usize) -> Self {
        Self(format!("{}[{index}]", self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn execution_id_v4_is_not_nil() {
        let id = ExecutionId::v4();
        assert!(!id.is_nil());
    }

    #[test]
    fn task_id_v4_is_not_nil() {
        let id = TaskId::v4();
        assert!(!id.is_nil());
    }

    #[test]
    fn execution_id_parse_roundtrip() {
        let id = ExecutionId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(id.to_string(), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn execution_id_parse_rejects_garbage() {
        assert!(ExecutionId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn task_id_serde_roundtrip() {
        let id = TaskId::v4();
        let json = serde_json::to_string(&id).unwrap();
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn string_ids_display_verbatim() {
        let wf = WorkflowId::new("checkout-flow");
        let step = StepId::new("login");
        let slave = SlaveId::new("worker-1");
        assert_eq!(wf.to_string(), "checkout-flow");
        assert_eq!(step.as_str(), "login");
        assert_eq!(slave.as_ref(), "worker-1");
    }

    #[test]
    fn string_id_serializes_transparently() {
        let step = StepId::new("login");
        assert_eq!(serde_json::to_string(&step).unwrap(), "\"login\"");
        let back: StepId = serde_json::from_str("\"login\"").unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn step_id_iteration_path() {
        let step = StepId::new("fetch");
        assert_eq!(step.iteration(0).as_str(), "fetch[0]");
        assert_eq!(step.iteration(12).as_str(), "fetch[12]");
    }

    #[test]
    fn different_uuid_id_types_are_incompatible() {
        fn accepts_execution(_id: ExecutionId) {}
        fn accepts_task(_id: TaskId) {}
        accepts_execution(ExecutionId::v4());
        accepts_task(TaskId::v4());
        // accepts_execution(TaskId::v4()); // Would not compile
    }
}
