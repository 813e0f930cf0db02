//! Bounded per-slave queues for the polling transport path.

use std::time::Duration;

use trellis_core::SlaveId;
use trellis_workflow::ControlCommand;

use crate::error::ClusterError;
use crate::task::TaskAssignment;

/// Default queue capacity for tasks and commands.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// How long an enqueue waits on a full queue before failing.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// One slave's pending work: a task queue and a command queue.
///
/// Queues are bounded MPMC channels; the polling handlers drain them
/// non-blockingly on heartbeat and task fetch. Closing the queues (on
/// unregister) makes further sends fail fast.
#[derive(Debug)]
pub struct SlaveQueues {
    slave_id: SlaveId,
    task_tx: async_channel::Sender<TaskAssignment>,
    task_rx: async_channel::Receiver<TaskAssignment>,
    command_tx: async_channel::Sender<ControlCommand>,
    command_rx: async_channel::Receiver<ControlCommand>,
}

impl SlaveQueues {
    /// Queues with the given bound.
    #[must_use]
    pub fn new(slave_id: SlaveId, capacity: usize) -> Self {
        let (task_tx, task_rx) = async_channel::bounded(capacity.max(1));
        let (command_tx, command_rx) = async_channel::bounded(capacity.max(1));
        Self {
            slave_id,
            task_tx,
            task_rx,
            command_tx,
            command_rx,
        }
    }

    /// Enqueue a task, waiting up to [`SEND_TIMEOUT`] for space.
    pub async fn enqueue_task(&self, task: TaskAssignment) -> Result<(), ClusterError> {
        match tokio::time::timeout(SEND_TIMEOUT, self.task_tx.send(task)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClusterError::QueueClosed(self.slave_id.clone())),
            Err(_) => Err(ClusterError::QueueFull(self.slave_id.clone())),
        }
    }

    /// Enqueue a command, waiting up to [`SEND_TIMEOUT`] for space.
    pub async fn enqueue_command(&self, command: ControlCommand) -> Result<(), ClusterError> {
        match tokio::time::timeout(SEND_TIMEOUT, self.command_tx.send(command)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClusterError::QueueClosed(self.slave_id.clone())),
            Err(_) => Err(ClusterError::QueueFull(self.slave_id.clone())),
        }
    }

    /// Drain all pending tasks without blocking, FIFO.
    #[must_use]
    pub fn drain_tasks(&self) -> Vec<TaskAssignment> {
        let mut tasks = Vec::new();
        while let Ok(task) = self.task_rx.try_recv() {
            tasks.push(task);
        }
        tasks
    }

    /// Drain all pending commands without blocking, FIFO.
    #[must_use]
    pub fn drain_commands(&self) -> Vec<ControlCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = self.command_rx.try_recv() {
            commands.push(command);
        }
        commands
    }

    /// Close both queues; pending items are dropped.
    pub fn close(&self) {
        self.task_tx.close();
        self.command_tx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use trellis_core::{ExecutionId, TaskId};
    use trellis_workflow::{CommandKind, Step, Workflow};

    use crate::task::Segment;

    fn task() -> TaskAssignment {
        TaskAssignment {
            task_id: TaskId::v4(),
            execution_id: ExecutionId::v4(),
            workflow: Workflow::new("wf", vec![Step::leaf("a", "http")]),
            segment: Segment::full(),
            vus: 1,
        }
    }

    #[tokio::test]
    async fn fifo_within_a_queue() {
        let queues = SlaveQueues::new(SlaveId::new("s1"), 10);
        let first = task();
        let second = task();
        queues.enqueue_task(first.clone()).await.unwrap();
        queues.enqueue_task(second.clone()).await.unwrap();

        let drained = queues.drain_tasks();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].task_id, first.task_id);
        assert_eq!(drained[1].task_id, second.task_id);
    }

    #[tokio::test]
    async fn drain_empties_the_queue() {
        let queues = SlaveQueues::new(SlaveId::new("s1"), 10);
        queues.enqueue_task(task()).await.unwrap();
        assert_eq!(queues.drain_tasks().len(), 1);
        assert!(queues.drain_tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_times_out_with_queue_full() {
        let queues = SlaveQueues::new(SlaveId::new("s1"), 1);
        queues.enqueue_task(task()).await.unwrap();

        let err = queues.enqueue_task(task()).await.unwrap_err();
        assert!(matches!(err, ClusterError::QueueFull(_)));
    }

    #[tokio::test]
    async fn closed_queue_rejects_sends() {
        let queues = SlaveQueues::new(SlaveId::new("s1"), 10);
        queues.close();
        let err = queues
            .enqueue_command(ControlCommand::new(CommandKind::Pause, ExecutionId::v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::QueueClosed(_)));
    }
}
