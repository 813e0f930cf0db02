//! The step tree.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use trellis_core::StepId;

use crate::hook::Hook;
use crate::processor::Processor;
use crate::retry::RetryPolicy;

/// One node of a workflow tree.
///
/// A step is a leaf (its `type` names an executor) or a composite: a
/// sequential `children` list, a `parallel` group, or a `loop`. The JSON
/// surface keeps these as optional fields; [`Step::body`] projects them to
/// a sum type and the workflow validator enforces that at most one is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Identifier, unique within the workflow tree.
    pub id: StepId,
    /// Executor type tag; required for leaves, ignored for composites.
    #[serde(rename = "type", default)]
    pub step_type: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Executor-specific configuration.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Timeout for this step; falls back to the workflow default.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Retry policy for a failing leaf body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Condition expression; a false result skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Processors run before the body.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_processors: Vec<Processor>,
    /// Processors run after the body.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_processors: Vec<Processor>,
    /// Hooks run before the body; a failure skips the step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_hooks: Vec<Hook>,
    /// Hooks run after the body, regardless of outcome.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_hooks: Vec<Hook>,
    /// Sequential children.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Step>,
    /// Parallel group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelGroup>,
    /// Loop specification.
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<LoopSpec>,
}

impl Step {
    /// Create a leaf step with the given executor tag.
    pub fn leaf(id: impl Into<StepId>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            name: String::new(),
            config: Map::new(),
            timeout: None,
            retry: None,
            condition: None,
            pre_processors: Vec::new(),
            post_processors: Vec::new(),
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
            children: Vec::new(),
            parallel: None,
            loop_spec: None,
        }
    }

    /// Create a sequential composite.
    pub fn sequence(id: impl Into<StepId>, children: Vec<Step>) -> Self {
        let mut step = Self::leaf(id, "");
        step.children = children;
        step
    }

    /// The step body as a sum type.
    #[must_use]
    pub fn body(&self) -> StepBody<'_> {
        if let Some(spec) = &self.loop_spec {
            StepBody::Loop(spec)
        } else if let Some(group) = &self.parallel {
            StepBody::Parallel(group)
        } else if !self.children.is_empty() {
            StepBody::Sequence(&self.children)
        } else {
            StepBody::Leaf
        }
    }

    /// Returns `true` if this step has no composite body.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        matches!(self.body(), StepBody::Leaf)
    }

    /// Number of leaves under (and including) this step.
    ///
    /// Loop bodies count once; the kernel uses this for progress
    /// denominators before iteration counts are known.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self.body() {
            StepBody::Leaf => 1,
            StepBody::Sequence(children) => children.iter().map(Step::leaf_count).sum(),
            StepBody::Parallel(group) => group.steps.iter().map(Step::leaf_count).sum(),
            StepBody::Loop(spec) => spec.steps.iter().map(Step::leaf_count).sum(),
        }
    }
}

/// A borrowed view of a step's body.
#[derive(Debug, Clone, Copy)]
pub enum StepBody<'a> {
    /// No composite body; dispatch to the executor named by `type`.
    Leaf,
    /// Run children in declared order.
    Sequence(&'a [Step]),
    /// Run the group members concurrently.
    Parallel(&'a ParallelGroup),
    /// Iterate the loop body.
    Loop(&'a LoopSpec),
}

/// A set of steps executed concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelGroup {
    /// Group members.
    pub steps: Vec<Step>,
    /// Fan-out bound; defaults to the member count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    /// Cancel peers when one branch fails.
    #[serde(default)]
    pub fail_fast: bool,
}

/// Loop configuration: exactly one of `count`, `over`, `while`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSpec {
    /// Iterate a fixed number of times.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Iterate over a sequence; `${...}` references resolve at loop entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over: Option<Value>,
    /// Iterate while the condition holds.
    #[serde(rename = "while", default, skip_serializing_if = "Option::is_none")]
    pub while_cond: Option<String>,
    /// Loop body.
    pub steps: Vec<Step>,
    /// Stop iterating after a failed iteration.
    #[serde(default)]
    pub break_on_error: bool,
    /// Run iterations on this many workers, collecting results in order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_workers: Option<usize>,
    /// Upper bound on `while` iterations.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    /// Discard variable writes at the end of each iteration.
    #[serde(default)]
    pub iteration_local: bool,
    /// Name bound to the current item; defaults to `item`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
}

fn default_max_iterations() -> u64 {
    10_000
}

impl LoopSpec {
    /// A spec with only the body set; callers pick the iteration source.
    #[must_use]
    pub fn body(steps: Vec<Step>) -> Self {
        Self {
            count: None,
            over: None,
            while_cond: None,
            steps,
            break_on_error: false,
            parallel_workers: None,
            max_iterations: default_max_iterations(),
            iteration_local: false,
            variable: None,
        }
    }

    /// The loop variable name.
    #[must_use]
    pub fn variable_name(&self) -> &str {
        self.variable.as_deref().unwrap_or("item")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn body_projection() {
        let leaf = Step::leaf("a", "http");
        assert!(leaf.is_leaf());

        let seq = Step::sequence("s", vec![Step::leaf("a", "http")]);
        assert!(matches!(seq.body(), StepBody::Sequence(_)));

        let mut par = Step::leaf("p", "");
        par.step_type = String::new();
        par.parallel = Some(ParallelGroup {
            steps: vec![Step::leaf("a", "http")],
            max_parallel: None,
            fail_fast: false,
        });
        assert!(matches!(par.body(), StepBody::Parallel(_)));
    }

    #[test]
    fn leaf_count_recurses() {
        let tree = Step::sequence(
            "root",
            vec![
                Step::leaf("a", "http"),
                Step::sequence("inner", vec![Step::leaf("b", "http"), Step::leaf("c", "http")]),
            ],
        );
        assert_eq!(tree.leaf_count(), 3);
    }

    #[test]
    fn step_deserializes_from_api_shape() {
        let json = serde_json::json!({
            "id": "login",
            "type": "http",
            "name": "Log in",
            "config": {"method": "POST", "url": "https://api/login"},
            "timeout": "10s",
            "condition": "${env.RUN_LOGIN} == '1'",
        });
        let step: Step = serde_json::from_value(json).unwrap();
        assert_eq!(step.step_type, "http");
        assert_eq!(step.timeout, Some(Duration::from_secs(10)));
        assert!(step.is_leaf());
    }

    #[test]
    fn loop_spec_defaults() {
        let json = serde_json::json!({
            "count": 3,
            "steps": [{"id": "x", "type": "http"}],
        });
        let spec: LoopSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.max_iterations, 10_000);
        assert_eq!(spec.variable_name(), "item");
        assert!(!spec.iteration_local);
    }

    #[test]
    fn while_field_name_on_the_wire() {
        let json = serde_json::json!({
            "while": "${n} < 5",
            "steps": [{"id": "x", "type": "http"}],
        });
        let spec: LoopSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.while_cond.as_deref(), Some("${n} < 5"));
    }
}
