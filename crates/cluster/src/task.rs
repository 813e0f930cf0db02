//! Task assignments and load segments.

use serde::{Deserialize, Serialize};

use trellis_core::{ExecutionId, TaskId};
use trellis_workflow::Workflow;

/// A sub-interval of `[0, 1]` assigned to one slave.
///
/// The segments of one execution partition `[0, 1]` exactly; a slave uses
/// its segment to derive data offsets and its share of the load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Inclusive start.
    pub start: f64,
    /// Exclusive end (inclusive for the last segment).
    pub end: f64,
}

impl Segment {
    /// The whole range.
    #[must_use]
    pub fn full() -> Self {
        Self { start: 0.0, end: 1.0 }
    }

    /// Segment width.
    #[must_use]
    pub fn width(&self) -> f64 {
        self.end - self.start
    }
}

/// One unit of distributed work: run `workflow` over `segment` with `vus`
/// virtual users.
///
/// Task ids are the dedup key: slaves must tolerate re-delivery, and the
/// coordinator ignores duplicate results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// Unique task id.
    pub task_id: TaskId,
    /// The execution this task belongs to.
    pub execution_id: ExecutionId,
    /// The workflow to run.
    pub workflow: Workflow,
    /// This slave's slice of the run.
    pub segment: Segment,
    /// Virtual users granted to this slave.
    pub vus: u32,
}
