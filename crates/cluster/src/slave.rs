//! Slave descriptors and the slave state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use trellis_core::SlaveId;

/// Static description a slave presents at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveInfo {
    /// Slave identifier (assigned by the master if empty).
    pub id: SlaveId,
    /// Deployment flavor, e.g. `container`, `vm`, `edge`.
    #[serde(rename = "type", default)]
    pub slave_type: String,
    /// Reachable address for out-of-band calls.
    #[serde(default)]
    pub address: String,
    /// Executor capabilities, e.g. `http`, `script`, `ai`.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Free-form placement labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Capacity figures used for task planning.
    #[serde(default)]
    pub resources: SlaveResources,
}

/// Capacity figures for one slave.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlaveResources {
    /// CPU cores available.
    pub cpu_cores: u32,
    /// Memory available, megabytes.
    pub memory_mb: u64,
    /// Most virtual users this slave will accept.
    pub max_vus: u32,
    /// Load fraction reported by the slave, `[0, 1]`.
    pub current_load: f64,
}

/// Lifecycle state of a registered slave.
///
/// Allowed transitions: `Online → Draining → Offline`, `Online → Failed`,
/// and `Failed → Online` on re-registration. Nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaveState {
    /// Accepting work.
    Online,
    /// Finishing existing tasks; not accepting new ones.
    Draining,
    /// Drained and gone.
    Offline,
    /// Missed heartbeats; kept for re-registration.
    Failed,
}

impl SlaveState {
    /// Whether moving to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Online, Self::Draining)
                | (Self::Draining, Self::Offline)
                | (Self::Online, Self::Failed)
                | (Self::Failed, Self::Online)
        )
    }

    /// Whether the slave can take new assignments.
    #[must_use]
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Online)
    }
}

impl std::fmt::Display for SlaveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Draining => write!(f, "draining"),
            Self::Offline => write!(f, "offline"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Dynamic state the registry tracks per slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveStatus {
    /// Lifecycle state.
    pub state: SlaveState,
    /// Load fraction from the latest heartbeat.
    pub load: f64,
    /// Tasks currently running on the slave.
    pub active_tasks: u32,
    /// Last heartbeat arrival; monotonically non-decreasing.
    pub last_seen: DateTime<Utc>,
    /// Slave-reported gauges.
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

impl SlaveStatus {
    /// A fresh online status stamped now.
    #[must_use]
    pub fn online() -> Self {
        Self {
            state: SlaveState::Online,
            load: 0.0,
            active_tasks: 0,
            last_seen: Utc::now(),
            metrics: HashMap::new(),
        }
    }
}
