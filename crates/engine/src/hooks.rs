//! The hook runner.
//!
//! Hooks dispatch through the executor registry under synthetic step ids.
//! Pre-hook failure skips the guarded entity (for a workflow pre-hook, the
//! entire workflow); post-hooks always run and their failures never change
//! the guarded entity's status.

use serde_json::Value;
use tracing::warn;

use trellis_core::StepId;
use trellis_workflow::{Hook, Step};

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::executor::ExecutorRegistry;
use crate::journal::JournalEntry;

/// Where a hook list hangs.
#[derive(Debug, Clone, Copy)]
pub enum HookPoint<'a> {
    /// Before any workflow step.
    WorkflowPre,
    /// After the last workflow step.
    WorkflowPost,
    /// Before one step's body.
    StepPre(&'a StepId),
    /// After one step's body.
    StepPost(&'a StepId),
}

impl HookPoint<'_> {
    /// The synthetic step id hooks at this point run under.
    #[must_use]
    pub fn synthetic_id(&self, index: usize) -> StepId {
        let base = match self {
            Self::WorkflowPre => "__workflow_pre_hook".to_owned(),
            Self::WorkflowPost => "__workflow_post_hook".to_owned(),
            Self::StepPre(step_id) => format!("__step_pre_hook_{step_id}"),
            Self::StepPost(step_id) => format!("__step_post_hook_{step_id}"),
        };
        if index == 0 {
            StepId::new(base)
        } else {
            StepId::new(format!("{base}_{index}"))
        }
    }

    fn is_post(&self) -> bool {
        matches!(self, Self::WorkflowPost | Self::StepPost(_))
    }
}

/// Run a hook list sequentially.
///
/// Pre lists stop at the first failure and return it. Post lists always run
/// every hook; the first failure is returned after the list finishes so the
/// caller can record it without changing the guarded entity's status.
pub async fn run_hooks(
    hooks: &[Hook],
    point: HookPoint<'_>,
    registry: &ExecutorRegistry,
    ctx: &ExecutionContext,
) -> Result<(), EngineError> {
    let mut first_failure: Option<EngineError> = None;

    for (index, hook) in hooks.iter().enumerate() {
        let hook_id = point.synthetic_id(index);
        let outcome = run_one(hook, &hook_id, registry, ctx).await;

        if let Err(error) = outcome {
            warn!(hook = %hook_id, %error, "hook failed");
            ctx.append_journal(JournalEntry::HookFailure {
                hook_id: hook_id.clone(),
                message: error.to_string(),
                at: chrono::Utc::now(),
            });
            if point.is_post() {
                first_failure.get_or_insert(error);
            } else {
                return Err(error);
            }
        }
    }

    match first_failure {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

async fn run_one(
    hook: &Hook,
    hook_id: &StepId,
    registry: &ExecutorRegistry,
    ctx: &ExecutionContext,
) -> Result<(), EngineError> {
    let executor = registry
        .resolve(&hook.hook_type)
        .map_err(|e| EngineError::Hook(format!("{hook_id}: {e}")))?;

    let mut synthetic = Step::leaf(hook_id.clone(), hook.hook_type.clone());
    synthetic.config = hook.config.clone();

    let result = executor
        .execute(&synthetic, ctx)
        .await
        .map_err(|e| EngineError::Hook(format!("{hook_id}: {e}")))?;

    if result.status.is_failure() {
        let detail = result
            .error
            .unwrap_or_else(|| format!("status {}", result.status));
        return Err(EngineError::Hook(format!("{hook_id}: {detail}")));
    }
    // Expose hook output for later steps, like any other result.
    if result.output != Value::Null {
        ctx.set_result(hook_id.as_str(), result.output);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{CallbackHandle, NoopCallback};
    use crate::executors::register_builtins;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use trellis_core::ExecutionId;

    fn context() -> ExecutionContext {
        ExecutionContext::new(
            ExecutionId::v4(),
            serde_json::Map::new(),
            CallbackHandle::new(Arc::new(NoopCallback)),
            CancellationToken::new(),
        )
    }

    fn registry() -> ExecutorRegistry {
        let registry = ExecutorRegistry::new();
        register_builtins(&registry).unwrap();
        registry
    }

    fn assertion_hook(expected: bool) -> Hook {
        Hook::new(
            "assertion",
            json!({"expected": expected}).as_object().cloned().unwrap(),
        )
    }

    #[test]
    fn synthetic_ids_follow_the_naming_scheme() {
        let step_id = StepId::new("login");
        assert_eq!(
            HookPoint::WorkflowPre.synthetic_id(0).as_str(),
            "__workflow_pre_hook"
        );
        assert_eq!(
            HookPoint::StepPre(&step_id).synthetic_id(0).as_str(),
            "__step_pre_hook_login"
        );
        assert_eq!(
            HookPoint::StepPost(&step_id).synthetic_id(1).as_str(),
            "__step_post_hook_login_1"
        );
    }

    #[tokio::test]
    async fn passing_hooks_run_clean() {
        let ctx = context();
        let hooks = [assertion_hook(true), assertion_hook(true)];
        run_hooks(&hooks, HookPoint::WorkflowPre, &registry(), &ctx)
            .await
            .unwrap();
        assert!(ctx.journal().is_empty());
    }

    #[tokio::test]
    async fn pre_list_stops_at_first_failure() {
        let ctx = context();
        let step_id = StepId::new("s");
        let hooks = [assertion_hook(false), assertion_hook(true)];
        let err = run_hooks(&hooks, HookPoint::StepPre(&step_id), &registry(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Hook(_)));

        // Exactly one failure journaled: the list stopped.
        let failures = ctx
            .journal()
            .into_iter()
            .filter(|e| matches!(e, JournalEntry::HookFailure { .. }))
            .count();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn post_list_runs_everything_and_reports_first_failure() {
        let ctx = context();
        let step_id = StepId::new("s");
        // A passing hook AFTER the failing one must still run; we can see it
        // ran because assertion results register through the hook executor.
        let hooks = [assertion_hook(false), assertion_hook(true)];
        let err = run_hooks(&hooks, HookPoint::StepPost(&step_id), &registry(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Hook(_)));

        // The second (passing) hook stored its output.
        assert_eq!(
            ctx.get_result("__step_post_hook_s_1"),
            Some(serde_json::Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn unknown_hook_type_is_a_hook_error() {
        let ctx = context();
        let hooks = [Hook::new("not_a_thing", serde_json::Map::new())];
        let err = run_hooks(&hooks, HookPoint::WorkflowPre, &registry(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Hook(_)));
    }
}
