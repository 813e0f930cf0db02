//! Wire protocol: the duplex envelope and the polling-path DTOs.
//!
//! The duplex channel carries [`Message`] envelopes serialized as
//! `{"type": ..., "data": ...}`. The REST polling path reuses the same
//! payload types inside plain JSON bodies. Framing (WebSocket, HTTP) is the
//! surrounding handler layer's concern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use trellis_core::{ExecutionId, SlaveId, TaskId};
use trellis_metrics::MetricsReport;
use trellis_workflow::ControlCommand;

use crate::slave::SlaveInfo;
use crate::task::TaskAssignment;

/// Protocol version advertised in registration acks.
pub const PROTOCOL_VERSION: &str = "1.0";

/// A duplex-channel envelope.
///
/// The first inbound message on a connection must be `register`; the master
/// answers `register_ack` and then pushes whatever was already queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    /// Slave → master: join the cluster.
    Register(SlaveInfo),
    /// Master → slave: registration accepted.
    RegisterAck(RegisterResponse),
    /// Slave → master: liveness plus load figures.
    Heartbeat(HeartbeatReport),
    /// Slave → master: keepalive reply.
    Pong,
    /// Master → slave: run this task.
    TaskAssign(TaskAssignment),
    /// Master → slave: control a running execution.
    Command(ControlCommand),
    /// Slave → master: a task finished.
    TaskResult(TaskResultReport),
    /// Slave → master: periodic metrics.
    Metrics(MetricsReportMessage),
}

/// Registration acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Whether registration was accepted.
    pub accepted: bool,
    /// The id the master filed the slave under.
    pub assigned_id: SlaveId,
    /// How often the slave should heartbeat.
    pub heartbeat_interval_ms: u64,
    /// Identifier of the accepting master.
    pub master_id: String,
    /// Protocol version.
    pub version: String,
}

/// Heartbeat payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReport {
    /// Reporting slave.
    pub slave_id: SlaveId,
    /// Load fraction, `[0, 1]`.
    #[serde(default)]
    pub load: f64,
    /// Tasks currently running.
    #[serde(default)]
    pub active_tasks: u32,
    /// Slave-side gauges.
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

/// Polling-path heartbeat reply: any commands queued since last poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Drained control commands, FIFO.
    #[serde(default)]
    pub commands: Vec<ControlCommand>,
}

/// Terminal status of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The task ran to completion.
    Completed,
    /// The task failed.
    Failed,
}

/// A task outcome reported by a slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultReport {
    /// The finished task.
    pub task_id: TaskId,
    /// Its execution.
    pub execution_id: ExecutionId,
    /// The reporting slave.
    pub slave_id: SlaveId,
    /// Terminal status.
    pub status: TaskStatus,
    /// Optional result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Errors the slave recorded while running the task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Slave-side progress for this execution, `[0, 1]`.
    #[serde(default)]
    pub progress: f64,
}

/// A periodic metrics report from a slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReportMessage {
    /// The execution the metrics belong to.
    pub execution_id: ExecutionId,
    /// The reporting slave.
    pub slave_id: SlaveId,
    /// When the slave took the snapshot.
    pub timestamp: DateTime<Utc>,
    /// The snapshot.
    pub metrics: MetricsReport,
}
