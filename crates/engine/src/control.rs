//! Per-execution control surfaces.
//!
//! API handlers never reach into the kernel; they look up the surface for
//! an execution id and call its handles.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use trellis_core::ExecutionId;
use trellis_metrics::{MetricsEngine, MetricsReport};
use trellis_workflow::ExecutionState;

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::journal::JournalEntry;
use crate::kernel::gate::PauseGate;

/// Handles for one live (or finished) execution.
#[derive(Debug)]
pub struct ControlSurface {
    execution_id: ExecutionId,
    state: Arc<RwLock<ExecutionState>>,
    metrics: Arc<MetricsEngine>,
    context: ExecutionContext,
    gate: PauseGate,
    cancel: CancellationToken,
    scale: watch::Sender<u32>,
    scalable: bool,
}

impl ControlSurface {
    pub(crate) fn new(
        execution_id: ExecutionId,
        state: Arc<RwLock<ExecutionState>>,
        metrics: Arc<MetricsEngine>,
        context: ExecutionContext,
        gate: PauseGate,
        cancel: CancellationToken,
        scale: watch::Sender<u32>,
        scalable: bool,
    ) -> Self {
        Self {
            execution_id,
            state,
            metrics,
            context,
            gate,
            cancel,
            scale,
            scalable,
        }
    }

    /// The execution this surface controls.
    #[must_use]
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Snapshot of the execution state.
    #[must_use]
    pub fn status(&self) -> ExecutionState {
        self.state.read().clone()
    }

    /// The execution's shared state cell (coordinator wiring).
    #[must_use]
    pub fn state_cell(&self) -> Arc<RwLock<ExecutionState>> {
        Arc::clone(&self.state)
    }

    /// The metrics engine.
    #[must_use]
    pub fn metrics(&self) -> Arc<MetricsEngine> {
        Arc::clone(&self.metrics)
    }

    /// Current metrics snapshot.
    #[must_use]
    pub fn metrics_snapshot(&self) -> MetricsReport {
        self.metrics.snapshot()
    }

    /// The journal so far.
    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.context.journal()
    }

    /// A step's stored output, by (possibly iteration-suffixed) id.
    #[must_use]
    pub fn step_output(&self, step_id: &str) -> Option<Value> {
        self.context.get_result(step_id)
    }

    /// A variable's current value.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<Value> {
        self.context.get_variable(name)
    }

    /// Hold at the next step boundary.
    pub fn pause(&self) {
        self.gate.pause();
        let _ = self
            .state
            .write()
            .transition_to(trellis_workflow::ExecutionStatus::Paused);
    }

    /// Release a paused execution.
    pub fn resume(&self) {
        let _ = self
            .state
            .write()
            .transition_to(trellis_workflow::ExecutionStatus::Running);
        self.gate.resume();
    }

    /// Whether the execution is gate-paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// Cancel the execution; in-flight steps observe it promptly.
    pub fn stop(&self) {
        // A paused execution must still observe the stop.
        self.cancel.cancel();
        self.gate.resume();
    }

    /// Retarget the virtual-user count (performance mode only).
    pub fn scale(&self, target_vus: u32) -> Result<(), EngineError> {
        if !self.scalable {
            return Err(EngineError::execution(
                "scale only applies to performance-mode executions",
            ));
        }
        self.scale
            .send(target_vus)
            .map_err(|_| EngineError::execution("execution already finished"))
    }

    /// Deliver a human-interaction response.
    ///
    /// Returns `false` when nothing is waiting under `interaction_id`.
    pub fn respond_interaction(&self, interaction_id: &str, value: Value) -> bool {
        self.context.respond_interaction(interaction_id, value)
    }
}

/// Registry of control surfaces keyed by execution id.
#[derive(Debug, Default)]
pub struct SurfaceRegistry {
    surfaces: DashMap<ExecutionId, Arc<ControlSurface>>,
}

impl SurfaceRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a surface.
    pub fn insert(&self, surface: Arc<ControlSurface>) {
        self.surfaces.insert(surface.execution_id(), surface);
    }

    /// Look up a surface.
    #[must_use]
    pub fn get(&self, execution_id: &ExecutionId) -> Option<Arc<ControlSurface>> {
        self.surfaces.get(execution_id).map(|s| Arc::clone(&s))
    }

    /// Drop a surface (e.g. when evicting finished executions).
    pub fn remove(&self, execution_id: &ExecutionId) {
        self.surfaces.remove(execution_id);
    }

    /// Snapshot the states of all registered executions.
    #[must_use]
    pub fn list_states(&self) -> Vec<ExecutionState> {
        self.surfaces.iter().map(|s| s.status()).collect()
    }
}
