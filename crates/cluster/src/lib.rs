#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Trellis Cluster
//!
//! Master-side coordination for distributed runs: the slave registry with
//! its state machine and health loop, the coordinator that picks slaves and
//! splits a load run into `[0, 1]` segments, bounded per-slave task and
//! command queues for the polling path, and the duplex session manager for
//! the push path.
//!
//! Delivery is at-least-once: the coordinator deduplicates inbound task
//! results by task id, and slaves are expected to do the same with
//! assignments. Within one path messages are FIFO per slave; the master
//! prefers a live duplex session and falls back to the polling queues.

pub mod coordinator;
pub mod error;
pub mod protocol;
pub mod queues;
pub mod registry;
pub mod session;
pub mod slave;
pub mod task;

pub use coordinator::{Coordinator, SlaveFilter};
pub use error::ClusterError;
pub use protocol::{
    HeartbeatReport, HeartbeatResponse, Message, MetricsReportMessage, RegisterResponse,
    TaskResultReport, TaskStatus,
};
pub use queues::{DEFAULT_QUEUE_CAPACITY, SEND_TIMEOUT, SlaveQueues};
pub use registry::{SlaveEvent, SlaveEventKind, SlaveRegistry, run_health_loop};
pub use session::{SessionManager, SlaveSession};
pub use slave::{SlaveInfo, SlaveResources, SlaveState, SlaveStatus};
pub use task::{Segment, TaskAssignment};
