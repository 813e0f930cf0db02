//! The shared execution context.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use trellis_core::ExecutionId;
use trellis_expression::{EvalScope, resolver};
use trellis_workflow::HttpResponseData;

use crate::callback::CallbackHandle;
use crate::journal::JournalEntry;

/// Where a variable write lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarScope {
    /// Execution-scoped variables.
    Temp,
    /// Promoted to the env-var overlay as well.
    Env,
}

/// Per-execution shared state: variables, env overlay, step results, the
/// latest HTTP response, the journal, pending interactions, and the
/// cancellation token.
///
/// Shared across the steps of one execution. Each map sits behind its own
/// lock; reads take a read lock and [`ExecutionContext::scope`] snapshots
/// under a single read lock per map. Parallel branches run on forks (see
/// [`ExecutionContext::fork`]) and merge write-sets back in completion
/// order.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// The owning execution.
    pub execution_id: ExecutionId,
    variables: Arc<RwLock<Map<String, Value>>>,
    env_vars: Arc<RwLock<HashMap<String, String>>>,
    results: Arc<RwLock<Map<String, Value>>>,
    response: Arc<RwLock<Option<HttpResponseData>>>,
    journal: Arc<Mutex<Vec<JournalEntry>>>,
    interactions: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
    /// Cooperative stop signal; every blocking call observes it.
    pub cancellation: CancellationToken,
    callback: CallbackHandle,
}

impl ExecutionContext {
    /// A fresh context with initial variables.
    pub fn new(
        execution_id: ExecutionId,
        variables: Map<String, Value>,
        callback: CallbackHandle,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            execution_id,
            variables: Arc::new(RwLock::new(variables)),
            env_vars: Arc::new(RwLock::new(HashMap::new())),
            results: Arc::new(RwLock::new(Map::new())),
            response: Arc::new(RwLock::new(None)),
            journal: Arc::new(Mutex::new(Vec::new())),
            interactions: Arc::new(Mutex::new(HashMap::new())),
            cancellation,
            callback,
        }
    }

    /// The serialized callback handle.
    #[must_use]
    pub fn callback(&self) -> &CallbackHandle {
        &self.callback
    }

    /// A fork for a parallel branch or an isolated loop iteration.
    ///
    /// Variables and the response slot are snapshotted; results, the env
    /// overlay, interactions, and the callback stay shared. The fork gets
    /// its own journal so its write-set can be merged back in completion
    /// order via [`ExecutionContext::merge_fork`].
    #[must_use]
    pub fn fork(&self, cancellation: CancellationToken) -> Self {
        Self {
            execution_id: self.execution_id,
            variables: Arc::new(RwLock::new(self.variables.read().clone())),
            env_vars: Arc::clone(&self.env_vars),
            results: Arc::clone(&self.results),
            response: Arc::new(RwLock::new(self.response.read().clone())),
            journal: Arc::new(Mutex::new(Vec::new())),
            interactions: Arc::clone(&self.interactions),
            cancellation,
            callback: self.callback.clone(),
        }
    }

    /// A fully isolated fork for a load-test iteration.
    ///
    /// Unlike [`ExecutionContext::fork`], the results map and journal are
    /// fresh and never merged back; thousands of iterations must not grow
    /// the parent's result set.
    #[must_use]
    pub fn fork_isolated(&self, cancellation: CancellationToken) -> Self {
        Self {
            execution_id: self.execution_id,
            variables: Arc::new(RwLock::new(self.variables.read().clone())),
            env_vars: Arc::clone(&self.env_vars),
            results: Arc::new(RwLock::new(Map::new())),
            response: Arc::new(RwLock::new(None)),
            journal: Arc::new(Mutex::new(Vec::new())),
            interactions: Arc::clone(&self.interactions),
            cancellation,
            callback: self.callback.clone(),
        }
    }

    /// Apply a fork's journal to this context: variable changes replay in
    /// order under the single writer, everything else is appended verbatim.
    pub fn merge_fork(&self, fork: &ExecutionContext) {
        let entries: Vec<JournalEntry> = std::mem::take(&mut *fork.journal.lock());
        for entry in entries {
            match entry {
                JournalEntry::VariableChange {
                    ref name,
                    ref new_value,
                    scope,
                    ref source,
                    ..
                } => {
                    self.set_variable(name.clone(), new_value.clone(), scope, source.clone());
                }
                other => self.journal.lock().push(other),
            }
        }
    }

    // ── variables ──────────────────────────────────────────────────────

    /// Write a variable, journaling the change.
    ///
    /// `Env` scope additionally promotes the value into the env overlay
    /// consulted by `${env.NAME}` references.
    pub fn set_variable(
        &self,
        name: impl Into<String>,
        value: Value,
        scope: VarScope,
        source: impl Into<String>,
    ) {
        let name = name.into();
        let old = {
            let mut variables = self.variables.write();
            variables.insert(name.clone(), value.clone())
        };
        if scope == VarScope::Env {
            self.env_vars
                .write()
                .insert(name.clone(), resolver::display_value(&value));
        }
        self.journal.lock().push(JournalEntry::variable_change(
            name,
            old.unwrap_or(Value::Null),
            value,
            scope,
            source.into(),
        ));
    }

    /// Read a variable.
    #[must_use]
    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.variables.read().get(name).cloned()
    }

    /// Remove a variable without journaling (loop bookkeeping).
    pub fn remove_variable(&self, name: &str) {
        self.variables.write().remove(name);
    }

    /// Snapshot of the variables map.
    #[must_use]
    pub fn variables(&self) -> Map<String, Value> {
        self.variables.read().clone()
    }

    /// Snapshot of the env overlay.
    #[must_use]
    pub fn env_vars(&self) -> HashMap<String, String> {
        self.env_vars.read().clone()
    }

    // ── results and response ───────────────────────────────────────────

    /// Store a step's output under its (possibly iteration-suffixed) id.
    pub fn set_result(&self, step_id: impl Into<String>, output: Value) {
        self.results.write().insert(step_id.into(), output);
    }

    /// Read a step's output.
    #[must_use]
    pub fn get_result(&self, step_id: &str) -> Option<Value> {
        self.results.read().get(step_id).cloned()
    }

    /// Replace the most recent HTTP response.
    pub fn set_response(&self, response: HttpResponseData) {
        *self.response.write() = Some(response);
    }

    /// The most recent HTTP response, consumed by post-processors.
    #[must_use]
    pub fn response(&self) -> Option<HttpResponseData> {
        self.response.read().clone()
    }

    /// A resolver/evaluator scope snapshotted from the current state.
    #[must_use]
    pub fn scope(&self) -> EvalScope {
        let mut scope =
            EvalScope::with_maps(self.variables.read().clone(), self.results.read().clone());
        scope.set_env_map(self.env_vars.read().clone());
        scope
    }

    // ── journal ────────────────────────────────────────────────────────

    /// Append a journal entry.
    pub fn append_journal(&self, entry: JournalEntry) {
        self.journal.lock().push(entry);
    }

    /// Snapshot of the journal, oldest first.
    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().clone()
    }

    // ── human interactions ─────────────────────────────────────────────

    /// Register a pending interaction; the returned receiver resolves when
    /// a response arrives via [`ExecutionContext::respond_interaction`].
    pub fn register_interaction(&self, id: impl Into<String>) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.interactions.lock().insert(id.into(), tx);
        rx
    }

    /// Deliver a response to a pending interaction.
    ///
    /// Returns `false` when the id is unknown or the waiter gave up.
    pub fn respond_interaction(&self, id: &str, value: Value) -> bool {
        match self.interactions.lock().remove(id) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drop a pending interaction (timeout path).
    pub fn cancel_interaction(&self, id: &str) {
        self.interactions.lock().remove(id);
    }

    /// Ids of interactions currently awaiting a response.
    #[must_use]
    pub fn pending_interactions(&self) -> Vec<String> {
        self.interactions.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::NoopCallback;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            ExecutionId::v4(),
            Map::new(),
            CallbackHandle::new(Arc::new(NoopCallback)),
            CancellationToken::new(),
        )
    }

    #[test]
    fn variable_write_journals_old_and_new() {
        let ctx = context();
        ctx.set_variable("token", json!("abc"), VarScope::Temp, "test");
        ctx.set_variable("token", json!("def"), VarScope::Temp, "test");

        let journal = ctx.journal();
        assert_eq!(journal.len(), 2);
        match &journal[1] {
            JournalEntry::VariableChange { old_value, new_value, .. } => {
                assert_eq!(old_value, &json!("abc"));
                assert_eq!(new_value, &json!("def"));
            }
            other => panic!("expected VariableChange, got {other:?}"),
        }
    }

    #[test]
    fn env_scope_promotes_to_overlay() {
        let ctx = context();
        ctx.set_variable("REGION", json!("eu-1"), VarScope::Env, "test");
        assert_eq!(ctx.env_vars().get("REGION").map(String::as_str), Some("eu-1"));
        assert_eq!(ctx.scope().env_var("REGION").as_deref(), Some("eu-1"));
    }

    #[test]
    fn scope_sees_variables_and_results() {
        let ctx = context();
        ctx.set_variable("a", json!(1), VarScope::Temp, "test");
        ctx.set_result("login", json!({"status": 200}));

        let scope = ctx.scope();
        assert_eq!(
            trellis_expression::resolve_path(&scope, "login.status").unwrap(),
            json!(200)
        );
        assert_eq!(trellis_expression::resolve_path(&scope, "a").unwrap(), json!(1));
    }

    #[test]
    fn fork_isolates_variables_but_shares_results() {
        let ctx = context();
        ctx.set_variable("x", json!(1), VarScope::Temp, "test");

        let fork = ctx.fork(ctx.cancellation.child_token());
        fork.set_variable("x", json!(2), VarScope::Temp, "branch");
        fork.set_result("inner", json!(true));

        // The parent still sees the snapshot value, but shared results.
        assert_eq!(ctx.get_variable("x"), Some(json!(1)));
        assert_eq!(ctx.get_result("inner"), Some(json!(true)));
    }

    #[test]
    fn merge_fork_replays_writes_in_order() {
        let ctx = context();
        ctx.set_variable("x", json!(1), VarScope::Temp, "test");

        let fork = ctx.fork(ctx.cancellation.child_token());
        fork.set_variable("x", json!(2), VarScope::Temp, "branch");
        fork.set_variable("y", json!("new"), VarScope::Temp, "branch");

        ctx.merge_fork(&fork);
        assert_eq!(ctx.get_variable("x"), Some(json!(2)));
        assert_eq!(ctx.get_variable("y"), Some(json!("new")));
    }

    #[test]
    fn interaction_roundtrip() {
        let ctx = context();
        let mut rx = ctx.register_interaction("q1");
        assert!(ctx.respond_interaction("q1", json!("yes")));
        assert_eq!(rx.try_recv().unwrap(), json!("yes"));
        // Unknown id.
        assert!(!ctx.respond_interaction("q2", json!("no")));
    }
}
