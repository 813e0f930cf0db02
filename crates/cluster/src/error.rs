//! Cluster error types.

use thiserror::Error;

use trellis_core::{ExecutionId, SlaveId};

use crate::slave::SlaveState;

/// Errors raised by the registry, coordinator, queues, and sessions.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The slave is not registered.
    #[error("slave not found: {0}")]
    SlaveNotFound(SlaveId),

    /// A slave state transition outside the allowed set.
    #[error("invalid slave transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: SlaveState,
        /// Attempted target state.
        to: SlaveState,
    },

    /// A bounded queue stayed full past the send timeout.
    #[error("queue full for slave {0}")]
    QueueFull(SlaveId),

    /// The slave's queues were closed by unregistration.
    #[error("queue closed for slave {0}")]
    QueueClosed(SlaveId),

    /// No live duplex session for the slave.
    #[error("no duplex session for slave {0}")]
    NoSession(SlaveId),

    /// The duplex send buffer is full; callers fall back to polling.
    #[error("duplex send buffer full for slave {0}")]
    SendBufferFull(SlaveId),

    /// The peer broke the duplex handshake rules.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Selection matched no online slave.
    #[error("no eligible slaves")]
    NoEligibleSlaves,

    /// The execution is not tracked by this coordinator.
    #[error("unknown execution: {0}")]
    UnknownExecution(ExecutionId),
}
