//! Workflow definition and execution options.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::Duration;

use trellis_core::WorkflowId;

use crate::error::WorkflowError;
use crate::hook::Hook;
use crate::step::{Step, StepBody};

/// A workflow definition: an ordered tree of steps plus run options.
///
/// Immutable during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Identifier chosen by the submitting client.
    pub id: WorkflowId,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Top-level steps, executed in order.
    pub steps: Vec<Step>,
    /// Run options.
    #[serde(default)]
    pub options: WorkflowOptions,
    /// Initial variables.
    #[serde(default)]
    pub variables: Map<String, Value>,
    /// Hooks run before any step.
    #[serde(default)]
    pub pre_hooks: Vec<Hook>,
    /// Hooks run after the last step, regardless of outcome.
    #[serde(default)]
    pub post_hooks: Vec<Hook>,
}

impl Workflow {
    /// Create a workflow with default options.
    pub fn new(id: impl Into<WorkflowId>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            name: None,
            steps,
            options: WorkflowOptions::default(),
            variables: Map::new(),
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }

    /// Total number of leaf steps in the tree (loop bodies counted once).
    #[must_use]
    pub fn total_leaves(&self) -> usize {
        self.steps.iter().map(Step::leaf_count).sum()
    }

    /// Validate the definition.
    ///
    /// Checks: non-empty workflow id, at least one step, unique step ids
    /// across the whole tree (children share the outer namespace), at most
    /// one body form per step, loop specs with exactly one iteration source,
    /// positive fan-out bounds, and positive stage durations.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.id.is_empty() {
            return Err(WorkflowError::EmptyWorkflowId);
        }
        if self.steps.is_empty() {
            return Err(WorkflowError::NoSteps);
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            validate_step(step, &mut seen)?;
        }

        for stage in &self.options.stages {
            if stage.duration.is_zero() {
                return Err(WorkflowError::InvalidOption(
                    "stage duration must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

fn validate_step(step: &Step, seen: &mut HashSet<String>) -> Result<(), WorkflowError> {
    if step.id.is_empty() {
        return Err(WorkflowError::EmptyStepId);
    }
    if !seen.insert(step.id.as_str().to_owned()) {
        return Err(WorkflowError::DuplicateStepId(step.id.clone()));
    }

    let mut forms = 0;
    if !step.children.is_empty() {
        forms += 1;
    }
    if step.parallel.is_some() {
        forms += 1;
    }
    if step.loop_spec.is_some() {
        forms += 1;
    }
    if forms > 1 {
        return Err(WorkflowError::AmbiguousBody(step.id.clone()));
    }

    match step.body() {
        StepBody::Leaf => {
            if step.step_type.is_empty() {
                return Err(WorkflowError::MissingStepType(step.id.clone()));
            }
        }
        StepBody::Sequence(children) => {
            for child in children {
                validate_step(child, seen)?;
            }
        }
        StepBody::Parallel(group) => {
            if group.max_parallel == Some(0) {
                return Err(WorkflowError::InvalidOption(format!(
                    "step {}: max_parallel must be at least 1",
                    step.id
                )));
            }
            for child in &group.steps {
                validate_step(child, seen)?;
            }
        }
        StepBody::Loop(spec) => {
            let sources = usize::from(spec.count.is_some())
                + usize::from(spec.over.is_some())
                + usize::from(spec.while_cond.is_some());
            if sources != 1 {
                return Err(WorkflowError::InvalidLoop {
                    step_id: step.id.clone(),
                    reason: "exactly one of count, over, while is required".into(),
                });
            }
            if spec.parallel_workers == Some(0) {
                return Err(WorkflowError::InvalidLoop {
                    step_id: step.id.clone(),
                    reason: "parallel_workers must be at least 1".into(),
                });
            }
            if spec.steps.is_empty() {
                return Err(WorkflowError::InvalidLoop {
                    step_id: step.id.clone(),
                    reason: "loop body is empty".into(),
                });
            }
            for child in &spec.steps {
                validate_step(child, seen)?;
            }
        }
    }
    Ok(())
}

/// How a workflow run is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run the tree once and report results.
    #[default]
    Functional,
    /// Load-test mode: virtual users iterate the tree for a duration.
    Performance,
}

/// A load ramp stage: hold or move toward `target_vus` for `duration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage length.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Virtual-user target at the end of the stage.
    pub target_vus: u32,
}

/// Run options for a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOptions {
    /// Functional or performance mode.
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Virtual users for performance mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vus: Option<u32>,
    /// Wall-clock bound for performance mode.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    /// Iteration bound for performance mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,
    /// Load ramp stages; overrides `vus` while active.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<Stage>,
    /// Cap on concurrently running leaves for one execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    /// Keep running sequential siblings after a failed step.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Default timeout for steps that set none.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub default_step_timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::LoopSpec;
    use pretty_assertions::assert_eq;

    fn leaf(id: &str) -> Step {
        Step::leaf(id, "http")
    }

    #[test]
    fn minimal_workflow_validates() {
        let wf = Workflow::new("wf-1", vec![leaf("a"), leaf("b")]);
        wf.validate().unwrap();
        assert_eq!(wf.total_leaves(), 2);
    }

    #[test]
    fn empty_id_rejected() {
        let wf = Workflow::new("", vec![leaf("a")]);
        assert!(matches!(wf.validate(), Err(WorkflowError::EmptyWorkflowId)));
    }

    #[test]
    fn no_steps_rejected() {
        let wf = Workflow::new("wf-1", vec![]);
        assert!(matches!(wf.validate(), Err(WorkflowError::NoSteps)));
    }

    #[test]
    fn duplicate_ids_rejected_across_nesting() {
        let mut parent = Step::leaf("dup", "http");
        parent.step_type = String::new();
        parent.children = vec![leaf("inner"), leaf("dup2")];
        let wf = Workflow::new("wf-1", vec![parent, leaf("dup2")]);
        assert!(matches!(
            wf.validate(),
            Err(WorkflowError::DuplicateStepId(id)) if id.as_str() == "dup2"
        ));
    }

    #[test]
    fn leaf_without_type_rejected() {
        let mut step = leaf("a");
        step.step_type = String::new();
        let wf = Workflow::new("wf-1", vec![step]);
        assert!(matches!(
            wf.validate(),
            Err(WorkflowError::MissingStepType(_))
        ));
    }

    #[test]
    fn loop_needs_exactly_one_source() {
        let mut step = Step::leaf("l", "");
        step.step_type = String::new();
        step.loop_spec = Some(LoopSpec {
            count: Some(3),
            over: Some(serde_json::json!([1, 2])),
            ..LoopSpec::body(vec![leaf("inner")])
        });
        let wf = Workflow::new("wf-1", vec![step]);
        assert!(matches!(wf.validate(), Err(WorkflowError::InvalidLoop { .. })));
    }

    #[test]
    fn ambiguous_body_rejected() {
        let mut step = Step::leaf("x", "");
        step.step_type = String::new();
        step.children = vec![leaf("c1")];
        step.loop_spec = Some(LoopSpec {
            count: Some(1),
            ..LoopSpec::body(vec![leaf("c2")])
        });
        let wf = Workflow::new("wf-1", vec![step]);
        assert!(matches!(wf.validate(), Err(WorkflowError::AmbiguousBody(_))));
    }

    #[test]
    fn options_deserialize_with_humantime() {
        let json = serde_json::json!({
            "mode": "performance",
            "vus": 50,
            "duration": "2m",
            "stages": [{"duration": "30s", "target_vus": 10}],
        });
        let options: WorkflowOptions = serde_json::from_value(json).unwrap();
        assert_eq!(options.mode, ExecutionMode::Performance);
        assert_eq!(options.duration, Some(Duration::from_secs(120)));
        assert_eq!(options.stages[0].target_vus, 10);
    }
}
