//! End-to-end slave lifecycle: register, heartbeat, assign, poll, drain.

use std::collections::HashMap;
use std::sync::Arc;

use trellis_cluster::{
    Coordinator, HeartbeatReport, Message, Segment, SlaveFilter, SlaveInfo, SlaveRegistry,
    SlaveResources, SlaveSession, SlaveState, TaskAssignment,
};
use trellis_core::{ExecutionId, SlaveId, TaskId};
use trellis_workflow::{Step, Workflow};

fn slave_info(id: &str) -> SlaveInfo {
    SlaveInfo {
        id: SlaveId::new(id),
        slave_type: "container".into(),
        address: format!("http://{id}:9000"),
        capabilities: vec!["http".into()],
        labels: HashMap::new(),
        resources: SlaveResources {
            cpu_cores: 2,
            memory_mb: 1024,
            max_vus: 50,
            current_load: 0.0,
        },
    }
}

fn assignment(execution_id: ExecutionId) -> TaskAssignment {
    TaskAssignment {
        task_id: TaskId::v4(),
        execution_id,
        workflow: Workflow::new("wf", vec![Step::leaf("ping", "http")]),
        segment: Segment::full(),
        vus: 10,
    }
}

#[tokio::test]
async fn polling_lifecycle_register_heartbeat_assign_drain() {
    let coordinator = Coordinator::new(Arc::new(SlaveRegistry::new()));

    // Register.
    let ack = coordinator.register_slave(slave_info("s1"));
    assert!(ack.accepted);
    let s1 = ack.assigned_id.clone();
    assert_eq!(s1, SlaveId::new("s1"));
    assert!(ack.heartbeat_interval_ms > 0);

    // Heartbeat once; no commands are queued yet.
    let response = coordinator
        .heartbeat(&HeartbeatReport {
            slave_id: s1.clone(),
            load: 0.2,
            active_tasks: 0,
            metrics: HashMap::new(),
        })
        .unwrap();
    assert!(response.commands.is_empty());

    // Assign one task; the polling fetch drains exactly that task.
    let execution_id = ExecutionId::v4();
    let task = assignment(execution_id);
    let task_id = task.task_id;
    coordinator.dispatch_task(&s1, task).await.unwrap();

    let drained = coordinator.poll_tasks(&s1).unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].task_id, task_id);
    assert!(coordinator.poll_tasks(&s1).unwrap().is_empty());

    // Drain: state flips and selection skips the slave.
    coordinator.drain_slave(&s1).unwrap();
    assert_eq!(
        coordinator.registry().get_status(&s1).unwrap().state,
        SlaveState::Draining
    );
    assert!(coordinator.select_slaves(&SlaveFilter::any()).is_empty());

    // Unregister removes the slave and closes its queues.
    coordinator.unregister_slave(&s1).unwrap();
    assert!(coordinator.registry().get_slave(&s1).is_none());
    assert!(coordinator.poll_tasks(&s1).is_err());
}

#[tokio::test]
async fn duplex_handshake_requires_register_first() {
    let coordinator = Coordinator::new(Arc::new(SlaveRegistry::new()));
    let mut session = SlaveSession::new();

    let err = session.handle(Message::Pong, &coordinator).unwrap_err();
    assert!(err.to_string().contains("first message must be register"));
}

#[tokio::test]
async fn duplex_register_drains_queued_work_down_the_channel() {
    let coordinator = Coordinator::new(Arc::new(SlaveRegistry::new()));

    // Queue a task through the polling path before the session exists.
    let ack = coordinator.register_slave(slave_info("s1"));
    let execution_id = ExecutionId::v4();
    coordinator
        .dispatch_task(&ack.assigned_id, assignment(execution_id))
        .await
        .unwrap();

    // The slave reconnects over the duplex channel.
    let mut session = SlaveSession::new();
    let output = session
        .handle(Message::Register(slave_info("s1")), &coordinator)
        .unwrap();

    assert!(output.outbound.is_some());
    assert!(matches!(output.replies[0], Message::RegisterAck(_)));
    assert!(matches!(output.replies[1], Message::TaskAssign(_)));
    assert_eq!(output.replies.len(), 2);
    assert_eq!(session.slave_id(), Some(&SlaveId::new("s1")));

    // Once the session exists the master pushes over it directly.
    let mut outbound = output.outbound.unwrap();
    coordinator
        .dispatch_task(&SlaveId::new("s1"), assignment(execution_id))
        .await
        .unwrap();
    assert!(matches!(outbound.try_recv().unwrap(), Message::TaskAssign(_)));
}

#[tokio::test]
async fn second_duplex_connection_displaces_the_first() {
    let coordinator = Coordinator::new(Arc::new(SlaveRegistry::new()));

    let mut first = SlaveSession::new();
    let first_output = first
        .handle(Message::Register(slave_info("s1")), &coordinator)
        .unwrap();
    let mut first_rx = first_output.outbound.unwrap();

    let mut second = SlaveSession::new();
    let second_output = second
        .handle(Message::Register(slave_info("s1")), &coordinator)
        .unwrap();
    assert!(second_output.outbound.is_some());

    // The first connection's receiver is now disconnected.
    assert!(matches!(
        first_rx.try_recv(),
        Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
    ));
}
