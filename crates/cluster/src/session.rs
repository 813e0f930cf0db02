//! Duplex sessions: the push transport path.
//!
//! A connection handler (WebSocket or otherwise) owns a [`SlaveSession`]
//! state machine and feeds it inbound [`Message`]s. The master-side send
//! half lives in the [`SessionManager`]; the handler forwards its receiver
//! down the wire. The framing itself is outside this crate.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use trellis_core::SlaveId;

use crate::coordinator::Coordinator;
use crate::error::ClusterError;
use crate::protocol::Message;

/// Default per-session send buffer.
pub const DEFAULT_SESSION_BUFFER: usize = 64;

/// Master-side registry of live duplex sessions.
///
/// Opening a session for a slave that already has one replaces the old send
/// half; the previous connection's forward loop observes its receiver close
/// and shuts down. Sends never block: a full buffer is an immediate error
/// so the caller can fall back to the polling queues.
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<SlaveId, mpsc::Sender<Message>>>,
}

impl SessionManager {
    /// An empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) the session for `slave_id`.
    ///
    /// Returns the receiver the connection handler forwards to the slave.
    pub fn open(&self, slave_id: &SlaveId, buffer: usize) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let previous = self.sessions.lock().insert(slave_id.clone(), tx);
        if previous.is_some() {
            info!(slave = %slave_id, "replacing duplex session, closing the older connection");
        }
        rx
    }

    /// Whether a live session exists.
    #[must_use]
    pub fn has_session(&self, slave_id: &SlaveId) -> bool {
        self.sessions
            .lock()
            .get(slave_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Push a message without blocking.
    pub fn try_send(&self, slave_id: &SlaveId, message: Message) -> Result<(), ClusterError> {
        let tx = {
            let sessions = self.sessions.lock();
            sessions
                .get(slave_id)
                .cloned()
                .ok_or_else(|| ClusterError::NoSession(slave_id.clone()))?
        };
        match tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(ClusterError::SendBufferFull(slave_id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.sessions.lock().remove(slave_id);
                Err(ClusterError::NoSession(slave_id.clone()))
            }
        }
    }

    /// Drop the session, if any.
    pub fn close(&self, slave_id: &SlaveId) {
        self.sessions.lock().remove(slave_id);
    }
}

/// What a session step produced.
#[derive(Debug)]
pub struct SessionOutput {
    /// Messages to send back down this connection, in order.
    pub replies: Vec<Message>,
    /// On successful registration: the outbound stream for this connection.
    pub outbound: Option<mpsc::Receiver<Message>>,
}

impl SessionOutput {
    fn none() -> Self {
        Self {
            replies: Vec::new(),
            outbound: None,
        }
    }
}

/// Per-connection protocol state machine.
///
/// The first inbound message must be `register`; everything else before
/// that is a protocol violation that should close the connection.
#[derive(Debug, Default)]
pub struct SlaveSession {
    slave_id: Option<SlaveId>,
}

impl SlaveSession {
    /// A fresh, unregistered session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The slave this session authenticated as, once registered.
    #[must_use]
    pub fn slave_id(&self) -> Option<&SlaveId> {
        self.slave_id.as_ref()
    }

    /// Feed one inbound message through the state machine.
    pub fn handle(
        &mut self,
        message: Message,
        coordinator: &Coordinator,
    ) -> Result<SessionOutput, ClusterError> {
        match (&self.slave_id, message) {
            (None, Message::Register(info)) => {
                let ack = coordinator.register_slave(info);
                let slave_id = ack.assigned_id.clone();
                let outbound = coordinator
                    .sessions()
                    .open(&slave_id, DEFAULT_SESSION_BUFFER);

                // Drain work queued before the session existed straight down
                // the channel, after the ack.
                let mut replies = vec![Message::RegisterAck(ack)];
                for task in coordinator.poll_tasks(&slave_id)? {
                    replies.push(Message::TaskAssign(task));
                }
                for command in coordinator.poll_commands(&slave_id)? {
                    replies.push(Message::Command(command));
                }

                debug!(slave = %slave_id, backlog = replies.len() - 1, "duplex session registered");
                self.slave_id = Some(slave_id);
                Ok(SessionOutput {
                    replies,
                    outbound: Some(outbound),
                })
            }
            (None, other) => Err(ClusterError::Protocol(format!(
                "first message must be register, got {}",
                envelope_kind(&other)
            ))),
            (Some(_), Message::Register(_)) => Err(ClusterError::Protocol(
                "register repeated on an established session".into(),
            )),
            (Some(_), Message::Heartbeat(report)) => {
                coordinator.heartbeat(&report)?;
                Ok(SessionOutput::none())
            }
            (Some(_), Message::TaskResult(report)) => {
                coordinator.receive_task_result(report)?;
                Ok(SessionOutput::none())
            }
            (Some(_), Message::Metrics(report)) => {
                coordinator.receive_metrics_report(report)?;
                Ok(SessionOutput::none())
            }
            (Some(_), Message::Pong) => Ok(SessionOutput::none()),
            (Some(_), unexpected) => Err(ClusterError::Protocol(format!(
                "unexpected {} from slave",
                envelope_kind(&unexpected)
            ))),
        }
    }
}

fn envelope_kind(message: &Message) -> &'static str {
    match message {
        Message::Register(_) => "register",
        Message::RegisterAck(_) => "register_ack",
        Message::Heartbeat(_) => "heartbeat",
        Message::Pong => "pong",
        Message::TaskAssign(_) => "task_assign",
        Message::Command(_) => "command",
        Message::TaskResult(_) => "task_result",
        Message::Metrics(_) => "metrics",
    }
}
