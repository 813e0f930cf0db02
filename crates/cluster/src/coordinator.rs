//! The coordinator: slave selection, load planning, task dispatch, and
//! inbound result/metric intake.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use trellis_core::{ExecutionId, SlaveId, TaskId};
use trellis_metrics::MetricsEngine;
use trellis_workflow::{
    ControlCommand, ErrorCode, ErrorEntry, ExecutionState, RetryPolicy, Workflow,
};

use crate::error::ClusterError;
use crate::protocol::{
    HeartbeatReport, HeartbeatResponse, Message, MetricsReportMessage, PROTOCOL_VERSION,
    RegisterResponse, TaskResultReport, TaskStatus,
};
use crate::queues::{DEFAULT_QUEUE_CAPACITY, SlaveQueues};
use crate::registry::SlaveRegistry;
use crate::session::SessionManager;
use crate::slave::{SlaveInfo, SlaveState};
use crate::task::{Segment, TaskAssignment};

/// Default heartbeat interval advertised to slaves.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Capability and label requirements for slave selection.
#[derive(Debug, Clone, Default)]
pub struct SlaveFilter {
    /// Capabilities the slave must advertise (all of them).
    pub capabilities: Vec<String>,
    /// Labels the slave must carry with matching values.
    pub labels: HashMap<String, String>,
}

impl SlaveFilter {
    /// A filter that matches every slave.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Whether `info` satisfies this filter.
    #[must_use]
    pub fn matches(&self, info: &SlaveInfo) -> bool {
        self.capabilities
            .iter()
            .all(|cap| info.capabilities.iter().any(|have| have == cap))
            && self
                .labels
                .iter()
                .all(|(key, value)| info.labels.get(key) == Some(value))
    }
}

#[derive(Debug)]
struct TrackedExecution {
    state: Arc<RwLock<ExecutionState>>,
    metrics: Arc<MetricsEngine>,
    seen_tasks: HashSet<TaskId>,
}

/// Master-side coordination of distributed executions.
#[derive(Debug)]
pub struct Coordinator {
    master_id: String,
    heartbeat_interval: Duration,
    registry: Arc<SlaveRegistry>,
    queues: Mutex<HashMap<SlaveId, Arc<SlaveQueues>>>,
    sessions: SessionManager,
    executions: Mutex<HashMap<ExecutionId, TrackedExecution>>,
}

impl Coordinator {
    /// A coordinator over the given registry.
    #[must_use]
    pub fn new(registry: Arc<SlaveRegistry>) -> Self {
        Self {
            master_id: format!("trellis-master-{}", uuid::Uuid::new_v4()),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            registry,
            queues: Mutex::new(HashMap::new()),
            sessions: SessionManager::new(),
            executions: Mutex::new(HashMap::new()),
        }
    }

    /// Override the advertised heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// The slave registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SlaveRegistry> {
        &self.registry
    }

    /// The duplex session manager.
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    // ── membership ─────────────────────────────────────────────────────

    /// Register a slave and provision its queues.
    ///
    /// An empty id gets one assigned.
    pub fn register_slave(&self, mut info: SlaveInfo) -> RegisterResponse {
        if info.id.is_empty() {
            info.id = SlaveId::new(format!("slave-{}", uuid::Uuid::new_v4()));
        }
        let id = info.id.clone();
        self.registry.register(info);
        self.queues
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(SlaveQueues::new(id.clone(), DEFAULT_QUEUE_CAPACITY)));

        RegisterResponse {
            accepted: true,
            assigned_id: id,
            heartbeat_interval_ms: self.heartbeat_interval.as_millis() as u64,
            master_id: self.master_id.clone(),
            version: PROTOCOL_VERSION.into(),
        }
    }

    /// Unregister a slave: close and drop its queues and session.
    pub fn unregister_slave(&self, id: &SlaveId) -> Result<(), ClusterError> {
        if let Some(queues) = self.queues.lock().remove(id) {
            queues.close();
        }
        self.sessions.close(id);
        self.registry.unregister(id)
    }

    /// Transition a slave to draining.
    pub fn drain_slave(&self, id: &SlaveId) -> Result<(), ClusterError> {
        self.registry.drain(id)
    }

    /// Process a heartbeat: update the registry, drain queued commands.
    pub fn heartbeat(&self, report: &HeartbeatReport) -> Result<HeartbeatResponse, ClusterError> {
        self.registry.heartbeat(
            &report.slave_id,
            report.load,
            report.active_tasks,
            report.metrics.clone(),
        )?;
        Ok(HeartbeatResponse {
            commands: self.poll_commands(&report.slave_id)?,
        })
    }

    // ── selection and planning ─────────────────────────────────────────

    /// Online slaves matching `filter`, ordered by current load, then
    /// active tasks, then id for determinism.
    #[must_use]
    pub fn select_slaves(&self, filter: &SlaveFilter) -> Vec<SlaveInfo> {
        let mut candidates: Vec<(SlaveInfo, f64, u32)> = self
            .registry
            .list()
            .into_iter()
            .filter(|(_, status)| status.state == SlaveState::Online)
            .filter(|(info, _)| filter.matches(info))
            .map(|(info, status)| (info, status.load, status.active_tasks))
            .collect();

        candidates.sort_by(|(a, a_load, a_tasks), (b, b_load, b_tasks)| {
            a_load
                .total_cmp(b_load)
                .then_with(|| a_tasks.cmp(b_tasks))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.into_iter().map(|(info, _, _)| info).collect()
    }

    /// Split a load run across `slaves`.
    ///
    /// Segment widths are proportional to each slave's `max_vus` and cover
    /// `[0, 1]` exactly. Per-slave VUs are `round(total × width)` with the
    /// rounding residual assigned to the widest slave, then clamped to
    /// `max_vus`.
    pub fn plan_load(
        &self,
        execution_id: ExecutionId,
        workflow: &Workflow,
        total_vus: u32,
        slaves: &[SlaveInfo],
    ) -> Result<Vec<TaskAssignment>, ClusterError> {
        if slaves.is_empty() {
            return Err(ClusterError::NoEligibleSlaves);
        }

        let weights: Vec<f64> = slaves
            .iter()
            .map(|s| f64::from(s.resources.max_vus.max(1)))
            .collect();
        let total_weight: f64 = weights.iter().sum();

        let mut assignments = Vec::with_capacity(slaves.len());
        let mut start = 0.0_f64;
        let mut granted: i64 = 0;
        let mut widest = 0usize;

        for (index, (slave, weight)) in slaves.iter().zip(&weights).enumerate() {
            let width = weight / total_weight;
            if width > weights[widest] / total_weight {
                widest = index;
            }
            let end = if index == slaves.len() - 1 {
                1.0
            } else {
                start + width
            };
            let vus = (f64::from(total_vus) * width).round() as i64;
            granted += vus;
            assignments.push(TaskAssignment {
                task_id: TaskId::v4(),
                execution_id,
                workflow: workflow.clone(),
                segment: Segment { start, end },
                vus: vus.max(0) as u32,
            });
            start = end;
        }

        // Rounding residual lands on the widest slave.
        let residual = i64::from(total_vus) - granted;
        if residual != 0 {
            let vus = i64::from(assignments[widest].vus) + residual;
            assignments[widest].vus = vus.max(0) as u32;
        }

        // Clamp to per-slave capacity.
        for (assignment, slave) in assignments.iter_mut().zip(slaves) {
            if slave.resources.max_vus > 0 {
                assignment.vus = assignment.vus.min(slave.resources.max_vus);
            }
        }

        debug!(
            execution = %execution_id,
            slaves = slaves.len(),
            total_vus,
            "planned load segments"
        );
        Ok(assignments)
    }

    // ── outbound dispatch ──────────────────────────────────────────────

    /// Deliver a task: duplex when a live session exists, else the polling
    /// queue.
    pub async fn dispatch_task(
        &self,
        slave_id: &SlaveId,
        assignment: TaskAssignment,
    ) -> Result<(), ClusterError> {
        if self.sessions.has_session(slave_id) {
            match self
                .sessions
                .try_send(slave_id, Message::TaskAssign(assignment.clone()))
            {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(slave = %slave_id, %error, "duplex push failed, falling back to polling queue");
                }
            }
        }
        self.slave_queues(slave_id)?.enqueue_task(assignment).await
    }

    /// Deliver a task, retrying transport-full conditions with the policy's
    /// backoff. Non-transport failures surface immediately.
    pub async fn dispatch_task_with_retry(
        &self,
        slave_id: &SlaveId,
        assignment: TaskAssignment,
        policy: &RetryPolicy,
    ) -> Result<(), ClusterError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.dispatch_task(slave_id, assignment.clone()).await {
                Ok(()) => return Ok(()),
                Err(error @ (ClusterError::QueueFull(_) | ClusterError::SendBufferFull(_))) => {
                    if attempt >= max_attempts {
                        return Err(error);
                    }
                    warn!(slave = %slave_id, attempt, %error, "task delivery backlogged, retrying");
                    tokio::time::sleep(policy.delay_for(attempt + 1)).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Deliver a control command, preferring the duplex path.
    pub async fn send_command(
        &self,
        slave_id: &SlaveId,
        command: ControlCommand,
    ) -> Result<(), ClusterError> {
        if self.sessions.has_session(slave_id) {
            match self
                .sessions
                .try_send(slave_id, Message::Command(command.clone()))
            {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(slave = %slave_id, %error, "duplex push failed, falling back to polling queue");
                }
            }
        }
        self.slave_queues(slave_id)?.enqueue_command(command).await
    }

    /// Drain pending tasks for the polling path.
    pub fn poll_tasks(&self, slave_id: &SlaveId) -> Result<Vec<TaskAssignment>, ClusterError> {
        Ok(self.slave_queues(slave_id)?.drain_tasks())
    }

    /// Drain pending commands for the polling path.
    pub fn poll_commands(&self, slave_id: &SlaveId) -> Result<Vec<ControlCommand>, ClusterError> {
        Ok(self.slave_queues(slave_id)?.drain_commands())
    }

    fn slave_queues(&self, slave_id: &SlaveId) -> Result<Arc<SlaveQueues>, ClusterError> {
        self.queues
            .lock()
            .get(slave_id)
            .cloned()
            .ok_or_else(|| ClusterError::SlaveNotFound(slave_id.clone()))
    }

    // ── inbound intake ─────────────────────────────────────────────────

    /// Start routing results and metrics for an execution.
    pub fn track_execution(
        &self,
        execution_id: ExecutionId,
        state: Arc<RwLock<ExecutionState>>,
        metrics: Arc<MetricsEngine>,
    ) {
        self.executions.lock().insert(execution_id, TrackedExecution {
            state,
            metrics,
            seen_tasks: HashSet::new(),
        });
    }

    /// Stop tracking an execution.
    pub fn untrack_execution(&self, execution_id: &ExecutionId) {
        self.executions.lock().remove(execution_id);
    }

    /// Fold a task result into the execution state.
    ///
    /// Returns `false` when the task id was already seen (at-least-once
    /// delivery dedup); the duplicate changes nothing.
    pub fn receive_task_result(&self, report: TaskResultReport) -> Result<bool, ClusterError> {
        let mut executions = self.executions.lock();
        let tracked = executions
            .get_mut(&report.execution_id)
            .ok_or(ClusterError::UnknownExecution(report.execution_id))?;

        if !tracked.seen_tasks.insert(report.task_id) {
            debug!(task = %report.task_id, "duplicate task result ignored");
            return Ok(false);
        }

        let mut state = tracked.state.write();
        let slave_state = state.slave_states.entry(report.slave_id.clone()).or_default();
        match report.status {
            TaskStatus::Completed => slave_state.completed_tasks += 1,
            TaskStatus::Failed => slave_state.failed_tasks += 1,
        }
        slave_state.progress = slave_state.progress.max(report.progress);
        slave_state.last_update = Utc::now();

        for message in &report.errors {
            state.push_error(ErrorEntry::new(ErrorCode::Execution, message.clone(), None));
        }

        let overall = state
            .slave_states
            .values()
            .map(|s| s.progress)
            .sum::<f64>()
            / state.slave_states.len().max(1) as f64;
        state.advance_progress(overall);
        Ok(true)
    }

    /// Merge a slave's metrics report into the execution's aggregator.
    pub fn receive_metrics_report(&self, message: MetricsReportMessage) -> Result<(), ClusterError> {
        let executions = self.executions.lock();
        let tracked = executions
            .get(&message.execution_id)
            .ok_or(ClusterError::UnknownExecution(message.execution_id))?;

        tracked.metrics.merge_report(&message.metrics);
        let mut state = tracked.state.write();
        if let Some(slave_state) = state.slave_states.get_mut(&message.slave_id) {
            slave_state.last_update = slave_state.last_update.max(message.timestamp);
        }
        Ok(())
    }
}
