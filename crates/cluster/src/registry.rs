//! The slave registry: membership, state transitions, watch events, and the
//! heartbeat health loop.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use trellis_core::SlaveId;

use crate::error::ClusterError;
use crate::slave::{SlaveInfo, SlaveState, SlaveStatus};

/// Default heartbeat timeout before a slave is marked failed.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default health-loop scan interval.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(10);

/// What happened to a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaveEventKind {
    /// A new slave joined.
    Registered,
    /// A slave left and its queues were dropped.
    Unregistered,
    /// Heartbeat data changed (load, active tasks, metrics).
    StatusChanged,
    /// The lifecycle state moved.
    StateTransitioned,
}

/// A registry change, delivered to watchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveEvent {
    /// Event kind.
    pub kind: SlaveEventKind,
    /// The slave's static info.
    pub info: SlaveInfo,
    /// The slave's status after the change.
    pub status: SlaveStatus,
}

#[derive(Debug, Clone)]
struct SlaveEntry {
    info: SlaveInfo,
    status: SlaveStatus,
}

/// Tracks registered slaves and publishes change events.
#[derive(Debug)]
pub struct SlaveRegistry {
    slaves: Mutex<HashMap<SlaveId, SlaveEntry>>,
    events: broadcast::Sender<SlaveEvent>,
}

impl Default for SlaveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SlaveRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            slaves: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Register a slave (or re-register a failed one).
    ///
    /// A failed slave transitions back to online; registering an id that is
    /// currently online or draining refreshes its info but keeps state.
    pub fn register(&self, info: SlaveInfo) -> SlaveStatus {
        let mut slaves = self.slaves.lock();
        let id = info.id.clone();

        let (entry, kind) = match slaves.remove(&id) {
            Some(mut existing) => {
                let kind = if existing.status.state == SlaveState::Failed {
                    existing.status.state = SlaveState::Online;
                    SlaveEventKind::StateTransitioned
                } else {
                    SlaveEventKind::StatusChanged
                };
                existing.info = info;
                existing.status.last_seen = Utc::now();
                (existing, kind)
            }
            None => (
                SlaveEntry {
                    info,
                    status: SlaveStatus::online(),
                },
                SlaveEventKind::Registered,
            ),
        };

        let status = entry.status.clone();
        let event = SlaveEvent {
            kind,
            info: entry.info.clone(),
            status: status.clone(),
        };
        slaves.insert(id.clone(), entry);
        drop(slaves);

        info!(slave = %id, "slave registered");
        let _ = self.events.send(event);
        status
    }

    /// Remove a slave entirely.
    pub fn unregister(&self, id: &SlaveId) -> Result<(), ClusterError> {
        let entry = self
            .slaves
            .lock()
            .remove(id)
            .ok_or_else(|| ClusterError::SlaveNotFound(id.clone()))?;
        info!(slave = %id, "slave unregistered");
        let _ = self.events.send(SlaveEvent {
            kind: SlaveEventKind::Unregistered,
            info: entry.info,
            status: entry.status,
        });
        Ok(())
    }

    /// Fold a heartbeat into the slave's status.
    ///
    /// `last_seen` only moves forward; a delayed heartbeat cannot rewind it.
    pub fn heartbeat(
        &self,
        id: &SlaveId,
        load: f64,
        active_tasks: u32,
        metrics: HashMap<String, f64>,
    ) -> Result<SlaveStatus, ClusterError> {
        let mut slaves = self.slaves.lock();
        let entry = slaves
            .get_mut(id)
            .ok_or_else(|| ClusterError::SlaveNotFound(id.clone()))?;

        entry.status.load = load;
        entry.status.active_tasks = active_tasks;
        entry.status.metrics = metrics;
        entry.status.last_seen = entry.status.last_seen.max(Utc::now());
        entry.info.resources.current_load = load;

        let event = SlaveEvent {
            kind: SlaveEventKind::StatusChanged,
            info: entry.info.clone(),
            status: entry.status.clone(),
        };
        let status = entry.status.clone();
        drop(slaves);
        let _ = self.events.send(event);
        Ok(status)
    }

    /// Move a slave through the state machine.
    pub fn transition(&self, id: &SlaveId, to: SlaveState) -> Result<(), ClusterError> {
        let mut slaves = self.slaves.lock();
        let entry = slaves
            .get_mut(id)
            .ok_or_else(|| ClusterError::SlaveNotFound(id.clone()))?;

        let from = entry.status.state;
        if !from.can_transition_to(to) {
            return Err(ClusterError::InvalidTransition { from, to });
        }
        entry.status.state = to;
        let event = SlaveEvent {
            kind: SlaveEventKind::StateTransitioned,
            info: entry.info.clone(),
            status: entry.status.clone(),
        };
        drop(slaves);

        info!(slave = %id, %from, %to, "slave state transitioned");
        let _ = self.events.send(event);
        Ok(())
    }

    /// Start draining: the slave keeps its tasks but gets no new ones.
    pub fn drain(&self, id: &SlaveId) -> Result<(), ClusterError> {
        self.transition(id, SlaveState::Draining)
    }

    /// A slave's static info.
    #[must_use]
    pub fn get_slave(&self, id: &SlaveId) -> Option<SlaveInfo> {
        self.slaves.lock().get(id).map(|e| e.info.clone())
    }

    /// A slave's dynamic status.
    #[must_use]
    pub fn get_status(&self, id: &SlaveId) -> Option<SlaveStatus> {
        self.slaves.lock().get(id).map(|e| e.status.clone())
    }

    /// All slaves with their statuses.
    #[must_use]
    pub fn list(&self) -> Vec<(SlaveInfo, SlaveStatus)> {
        self.slaves
            .lock()
            .values()
            .map(|e| (e.info.clone(), e.status.clone()))
            .collect()
    }

    /// Slaves currently accepting work.
    #[must_use]
    pub fn online_slaves(&self) -> Vec<SlaveInfo> {
        self.slaves
            .lock()
            .values()
            .filter(|e| e.status.state.accepts_work())
            .map(|e| e.info.clone())
            .collect()
    }

    /// Subscribe to registry changes.
    #[must_use]
    pub fn watch(&self) -> broadcast::Receiver<SlaveEvent> {
        self.events.subscribe()
    }

    /// Mark online slaves failed when their last heartbeat is older than
    /// `timeout`. Returns the ids that flipped.
    pub fn mark_stale_failed(&self, timeout: Duration, now: DateTime<Utc>) -> Vec<SlaveId> {
        let stale: Vec<SlaveId> = {
            let slaves = self.slaves.lock();
            slaves
                .iter()
                .filter(|(_, e)| {
                    e.status.state == SlaveState::Online
                        && now - e.status.last_seen
                            > chrono::Duration::from_std(timeout).unwrap_or_default()
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &stale {
            warn!(slave = %id, "heartbeat timeout, marking failed");
            let _ = self.transition(id, SlaveState::Failed);
        }
        stale
    }
}

/// Periodically flip unresponsive online slaves to failed.
pub async fn run_health_loop(
    registry: Arc<SlaveRegistry>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                registry.mark_stale_failed(timeout, Utc::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slave::SlaveResources;
    use pretty_assertions::assert_eq;

    fn info(id: &str) -> SlaveInfo {
        SlaveInfo {
            id: SlaveId::new(id),
            slave_type: "container".into(),
            address: format!("http://{id}:9000"),
            capabilities: vec!["http".into()],
            labels: HashMap::new(),
            resources: SlaveResources {
                cpu_cores: 4,
                memory_mb: 2048,
                max_vus: 100,
                current_load: 0.0,
            },
        }
    }

    #[test]
    fn register_then_get() {
        let registry = SlaveRegistry::new();
        registry.register(info("s1"));
        assert!(registry.get_slave(&SlaveId::new("s1")).is_some());
        assert_eq!(
            registry.get_status(&SlaveId::new("s1")).unwrap().state,
            SlaveState::Online
        );
    }

    #[test]
    fn watch_sees_registration() {
        let registry = SlaveRegistry::new();
        let mut watcher = registry.watch();
        registry.register(info("s1"));
        let event = watcher.try_recv().unwrap();
        assert_eq!(event.kind, SlaveEventKind::Registered);
        assert_eq!(event.info.id, SlaveId::new("s1"));
    }

    #[test]
    fn drain_rejects_new_work() {
        let registry = SlaveRegistry::new();
        registry.register(info("s1"));
        registry.drain(&SlaveId::new("s1")).unwrap();
        assert!(registry.online_slaves().is_empty());
        assert_eq!(
            registry.get_status(&SlaveId::new("s1")).unwrap().state,
            SlaveState::Draining
        );
    }

    #[test]
    fn drain_twice_is_invalid() {
        let registry = SlaveRegistry::new();
        registry.register(info("s1"));
        registry.drain(&SlaveId::new("s1")).unwrap();
        let err = registry.drain(&SlaveId::new("s1")).unwrap_err();
        assert!(matches!(err, ClusterError::InvalidTransition { .. }));
    }

    #[test]
    fn failed_slave_reregisters_online() {
        let registry = SlaveRegistry::new();
        registry.register(info("s1"));
        registry
            .transition(&SlaveId::new("s1"), SlaveState::Failed)
            .unwrap();
        assert!(registry.online_slaves().is_empty());

        let status = registry.register(info("s1"));
        assert_eq!(status.state, SlaveState::Online);
    }

    #[test]
    fn heartbeat_updates_load_and_last_seen() {
        let registry = SlaveRegistry::new();
        registry.register(info("s1"));
        let before = registry.get_status(&SlaveId::new("s1")).unwrap().last_seen;
        let status = registry
            .heartbeat(&SlaveId::new("s1"), 0.7, 3, HashMap::new())
            .unwrap();
        assert_eq!(status.load, 0.7);
        assert_eq!(status.active_tasks, 3);
        assert!(status.last_seen >= before);
    }

    #[test]
    fn heartbeat_for_unknown_slave_errors() {
        let registry = SlaveRegistry::new();
        let err = registry
            .heartbeat(&SlaveId::new("ghost"), 0.0, 0, HashMap::new())
            .unwrap_err();
        assert!(matches!(err, ClusterError::SlaveNotFound(_)));
    }

    #[test]
    fn stale_online_slaves_flip_to_failed() {
        let registry = SlaveRegistry::new();
        registry.register(info("s1"));
        registry.register(info("s2"));
        // Backdate s1's heartbeat.
        {
            let mut slaves = registry.slaves.lock();
            let entry = slaves.get_mut(&SlaveId::new("s1")).unwrap();
            entry.status.last_seen = Utc::now() - chrono::Duration::seconds(120);
        }

        let flipped = registry.mark_stale_failed(Duration::from_secs(30), Utc::now());
        assert_eq!(flipped, vec![SlaveId::new("s1")]);
        assert_eq!(
            registry.get_status(&SlaveId::new("s1")).unwrap().state,
            SlaveState::Failed
        );
        assert_eq!(
            registry.get_status(&SlaveId::new("s2")).unwrap().state,
            SlaveState::Online
        );
    }

    #[test]
    fn unregister_removes_and_notifies() {
        let registry = SlaveRegistry::new();
        registry.register(info("s1"));
        let mut watcher = registry.watch();
        registry.unregister(&SlaveId::new("s1")).unwrap();
        assert!(registry.get_slave(&SlaveId::new("s1")).is_none());
        let event = watcher.try_recv().unwrap();
        assert_eq!(event.kind, SlaveEventKind::Unregistered);
    }
}
