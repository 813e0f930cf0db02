#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Trellis Core
//!
//! Shared identifier types and serde helpers used by every Trellis crate.
//!
//! Runtime-generated identifiers ([`ExecutionId`], [`TaskId`]) are UUID-backed
//! and `Copy`; client-supplied identifiers ([`WorkflowId`], [`StepId`],
//! [`SlaveId`]) are string newtypes, since workflow authors and slave
//! deployments choose them.

pub mod id;

pub use id::{ExecutionId, SlaveId, StepId, TaskId, WorkflowId};

/// Serde helper for `Duration` serialized as integer milliseconds.
pub mod serde_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    /// Serialize a `Duration` as an integer of milliseconds.
    pub fn serialize<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (duration.as_millis() as u64).serialize(s)
    }

    /// Deserialize an integer of milliseconds into a `Duration`.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde helper for `Option<Duration>` serialized as milliseconds.
pub mod serde_millis_opt {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    /// Serialize an `Option<Duration>` as an optional integer of milliseconds.
    pub fn serialize<S: Serializer>(duration: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(s),
            None => s.serialize_none(),
        }
    }

    /// Deserialize an optional integer of milliseconds into an `Option<Duration>`.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let opt: Option<u64> = Option::deserialize(d)?;
        Ok(opt.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Timed {
        #[serde(with = "super::serde_millis")]
        elapsed: Duration,
        #[serde(with = "super::serde_millis_opt")]
        timeout: Option<Duration>,
    }

    #[test]
    fn millis_roundtrip() {
        let t = Timed {
            elapsed: Duration::from_millis(1500),
            timeout: Some(Duration::from_secs(5)),
        };
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["elapsed"], 1500);
        assert_eq!(json["timeout"], 5000);

        let back: Timed = serde_json::from_value(json).unwrap();
        assert_eq!(back.elapsed, Duration::from_millis(1500));
        assert_eq!(back.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn millis_opt_none() {
        let t = Timed {
            elapsed: Duration::ZERO,
            timeout: None,
        };
        let json = serde_json::to_value(&t).unwrap();
        assert!(json["timeout"].is_null());
        let back: Timed = serde_json::from_value(json).unwrap();
        assert_eq!(back.timeout, None);
    }
}
