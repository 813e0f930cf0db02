//! The execution kernel: tree walk, dispatch, lifecycle controls.

pub mod gate;
pub(crate) mod vus;

use futures::StreamExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_core::{ExecutionId, StepId};
use trellis_metrics::{MetricsEngine, Threshold};
use trellis_workflow::{
    ErrorCode, ErrorEntry, ExecutionMode, ExecutionState, ExecutionStatus, HttpResponseData,
    LoopSpec, ParallelGroup, RetryPolicy, Step, StepBody, StepResult, StepStatus, Workflow,
};

use crate::callback::{CallbackHandle, ExecutionCallback};
use crate::context::{ExecutionContext, VarScope};
use crate::control::{ControlSurface, SurfaceRegistry};
use crate::error::EngineError;
use crate::executor::ExecutorRegistry;
use crate::hooks::{HookPoint, run_hooks};
use crate::journal::JournalEntry;
use crate::processors::{ProcessorPhase, run_processors};
use gate::PauseGate;

/// Kernel-wide defaults applied to every execution.
#[derive(Debug, Clone, Default)]
pub struct KernelConfig {
    /// Cap on concurrent leaves per execution; defaults to `2 × cores`.
    pub max_concurrent: Option<usize>,
    /// Timeout for steps that set none (workflow options take precedence).
    pub default_step_timeout: Option<Duration>,
    /// Metric time-series bucket interval.
    pub metric_bucket_interval: Option<Duration>,
    /// Metric time-series ring capacity.
    pub metric_bucket_capacity: Option<usize>,
    /// Thresholds evaluated on every bucket boundary.
    pub thresholds: Vec<Threshold>,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(8)
}

/// Shared per-execution runtime handles.
pub(crate) struct ExecEnv {
    pub(crate) execution_id: ExecutionId,
    pub(crate) state: Arc<RwLock<ExecutionState>>,
    pub(crate) metrics: Arc<MetricsEngine>,
    pub(crate) gate: PauseGate,
    pub(crate) cancel: CancellationToken,
    pub(crate) leaf_permits: Arc<Semaphore>,
    pub(crate) continue_on_error: bool,
    pub(crate) default_timeout: Option<Duration>,
    pub(crate) callback: CallbackHandle,
    /// Functional mode derives progress from step counters; load mode
    /// derives it from elapsed time or the iteration budget.
    pub(crate) progress_by_steps: bool,
    pub(crate) scale: watch::Sender<u32>,
}

struct Prepared {
    workflow: Arc<Workflow>,
    ctx: ExecutionContext,
    env: Arc<ExecEnv>,
}

/// The workflow execution kernel.
///
/// One kernel serves many executions; per-execution state lives behind the
/// control surfaces it registers.
pub struct Kernel {
    registry: Arc<ExecutorRegistry>,
    surfaces: Arc<SurfaceRegistry>,
    config: KernelConfig,
}

impl Kernel {
    /// A kernel over the given executor registry.
    #[must_use]
    pub fn new(registry: Arc<ExecutorRegistry>) -> Self {
        Self {
            registry,
            surfaces: Arc::new(SurfaceRegistry::new()),
            config: KernelConfig::default(),
        }
    }

    /// Override kernel defaults.
    #[must_use]
    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// The executor registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    /// The control-surface registry.
    #[must_use]
    pub fn surfaces(&self) -> &Arc<SurfaceRegistry> {
        &self.surfaces
    }

    /// Submit a workflow and return once it is accepted.
    ///
    /// The execution runs on a background task; observe it through the
    /// callback or the control surface.
    pub fn submit(
        &self,
        workflow: Workflow,
        callback: Arc<dyn ExecutionCallback>,
    ) -> Result<ExecutionId, EngineError> {
        let prepared = self.prepare(workflow, callback)?;
        let execution_id = prepared.env.execution_id;
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            drive(&registry, prepared).await;
        });
        Ok(execution_id)
    }

    /// Run a workflow to completion and return its final state.
    pub async fn run(
        &self,
        workflow: Workflow,
        callback: Arc<dyn ExecutionCallback>,
    ) -> Result<ExecutionState, EngineError> {
        let prepared = self.prepare(workflow, callback)?;
        Ok(drive(&self.registry, prepared).await)
    }

    fn prepare(
        &self,
        workflow: Workflow,
        callback: Arc<dyn ExecutionCallback>,
    ) -> Result<Prepared, EngineError> {
        workflow.validate()?;

        let execution_id = ExecutionId::v4();
        let total_leaves = workflow.total_leaves() as u64;
        let state = Arc::new(RwLock::new(ExecutionState::new(
            execution_id,
            workflow.id.clone(),
            total_leaves,
        )));
        let metrics = Arc::new(MetricsEngine::with_config(
            self.config
                .metric_bucket_interval
                .unwrap_or(trellis_metrics::timeseries::DEFAULT_INTERVAL),
            self.config
                .metric_bucket_capacity
                .unwrap_or(trellis_metrics::timeseries::DEFAULT_CAPACITY),
            self.config.thresholds.clone(),
        ));

        let callback = CallbackHandle::new(callback);
        let cancel = CancellationToken::new();
        let ctx = ExecutionContext::new(
            execution_id,
            workflow.variables.clone(),
            callback.clone(),
            cancel.clone(),
        );
        let gate = PauseGate::new();

        let scalable = workflow.options.mode == ExecutionMode::Performance;
        let (scale, _) = watch::channel(workflow.options.vus.unwrap_or(1).max(1));

        let max_concurrent = workflow
            .options
            .max_concurrent
            .or(self.config.max_concurrent)
            .unwrap_or_else(default_concurrency)
            .max(1);

        let env = Arc::new(ExecEnv {
            execution_id,
            state: Arc::clone(&state),
            metrics: Arc::clone(&metrics),
            gate: gate.clone(),
            cancel: cancel.clone(),
            leaf_permits: Arc::new(Semaphore::new(max_concurrent)),
            continue_on_error: workflow.options.continue_on_error,
            default_timeout: workflow
                .options
                .default_step_timeout
                .or(self.config.default_step_timeout),
            callback,
            progress_by_steps: !scalable,
            scale: scale.clone(),
        });

        self.surfaces.insert(Arc::new(ControlSurface::new(
            execution_id,
            state,
            metrics,
            ctx.clone(),
            gate,
            cancel,
            scale,
            scalable,
        )));

        info!(execution = %execution_id, workflow = %workflow.id, "execution accepted");
        Ok(Prepared {
            workflow: Arc::new(workflow),
            ctx,
            env,
        })
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

// ── the drive loop ─────────────────────────────────────────────────────

async fn drive(registry: &Arc<ExecutorRegistry>, prepared: Prepared) -> ExecutionState {
    let Prepared { workflow, ctx, env } = prepared;

    {
        let _ = env.state.write().transition_to(ExecutionStatus::Running);
    }
    env.callback.progress(env.execution_id, 0.0).await;

    let pre_ok = match run_hooks(&workflow.pre_hooks, HookPoint::WorkflowPre, registry, &ctx).await
    {
        Ok(()) => true,
        Err(error) => {
            warn!(execution = %env.execution_id, %error, "workflow pre-hook failed, skipping all steps");
            env.state
                .write()
                .push_error(ErrorEntry::new(ErrorCode::Hook, error.to_string(), None));
            false
        }
    };

    if pre_ok {
        match workflow.options.mode {
            ExecutionMode::Functional => {
                run_sequence(registry, &workflow.steps, &ctx, &env, "").await;
            }
            ExecutionMode::Performance => {
                vus::run_load(registry, &workflow, &ctx, &env).await;
            }
        }
    } else {
        for step in &workflow.steps {
            mark_leaves_skipped(step, &ctx, &env, "", "workflow pre-hook failed").await;
        }
    }

    if let Err(error) =
        run_hooks(&workflow.post_hooks, HookPoint::WorkflowPost, registry, &ctx).await
    {
        env.state
            .write()
            .push_error(ErrorEntry::new(ErrorCode::Hook, error.to_string(), None));
    }

    let _ = env.metrics.final_report();

    let final_status = {
        let state = env.state.read();
        if env.cancel.is_cancelled() {
            ExecutionStatus::Aborted
        } else if !pre_ok || state.failed_steps > 0 {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        }
    };
    {
        let mut state = env.state.write();
        let _ = state.transition_to(final_status);
    }

    let snapshot = env.state.read().clone();
    info!(execution = %env.execution_id, status = %snapshot.status, "execution finished");
    env.callback.execution_complete(&snapshot).await;
    snapshot
}

/// Run steps in declared order; without `continue_on_error` the first
/// failure skips everything after it.
pub(crate) async fn run_sequence(
    registry: &Arc<ExecutorRegistry>,
    steps: &[Step],
    ctx: &ExecutionContext,
    env: &Arc<ExecEnv>,
    suffix: &str,
) -> bool {
    let mut all_ok = true;
    let mut iter = steps.iter();
    while let Some(step) = iter.next() {
        let result = dispatch_step(registry, step, ctx, env, suffix).await;
        if result.status.is_failure() {
            all_ok = false;
            if !env.continue_on_error {
                for remaining in iter {
                    mark_leaves_skipped(remaining, ctx, env, suffix, "previous step failed").await;
                }
                break;
            }
        }
    }
    all_ok
}

/// Dispatch one step: condition, processors, hooks, body, events.
pub(crate) fn dispatch_step<'a>(
    registry: &'a Arc<ExecutorRegistry>,
    step: &'a Step,
    ctx: &'a ExecutionContext,
    env: &'a Arc<ExecEnv>,
    suffix: &'a str,
) -> BoxFuture<'a, StepResult> {
    Box::pin(async move {
        let result_id = StepId::new(format!("{}{suffix}", step.id));

        // Step boundary: honor stop and pause before doing anything.
        tokio::select! {
            () = ctx.cancellation.cancelled() => {
                return skip_step(step, &result_id, ctx, env, suffix, "aborted").await;
            }
            () = env.gate.wait_open() => {}
        }
        if ctx.cancellation.is_cancelled() {
            return skip_step(step, &result_id, ctx, env, suffix, "aborted").await;
        }

        env.callback.step_start(env.execution_id, &result_id).await;
        ctx.append_journal(JournalEntry::StepStarted {
            step_id: result_id.clone(),
            at: chrono::Utc::now(),
        });
        let started = Instant::now();

        // 1. Condition gate.
        if let Some(condition) = &step.condition {
            match trellis_expression::evaluate(condition, &ctx.scope()) {
                Ok(true) => {}
                Ok(false) => {
                    return skip_step(step, &result_id, ctx, env, suffix, "condition=false").await;
                }
                Err(error) => {
                    let engine_error = EngineError::from(error);
                    let result = StepResult::failed(result_id.clone(), engine_error.to_string());
                    return finalize(step, result, started, 1, Some(engine_error.code()), ctx, env)
                        .await;
                }
            }
        }

        let mut assertions = Vec::new();
        let mut code_override: Option<ErrorCode> = None;
        let mut attempts = 1;

        // 2. Pre-processors. An error fails the step and skips everything
        // but the post-hooks.
        let mut body_result: Option<StepResult> =
            match run_processors(ProcessorPhase::Pre, &step.pre_processors, step, ctx).await {
                Ok(list) => {
                    let failed = list.iter().any(|a| !a.passed);
                    assertions.extend(list);
                    if failed {
                        Some(StepResult::failed(
                            result_id.clone(),
                            "pre-step assertion failed",
                        ))
                    } else {
                        None
                    }
                }
                Err(error) => {
                    code_override = Some(error.code());
                    Some(StepResult::failed(result_id.clone(), error.to_string()))
                }
            };

        // 3. Pre-hooks. A failure skips the body.
        if body_result.is_none() {
            if let Err(error) =
                run_hooks(&step.pre_hooks, HookPoint::StepPre(&step.id), registry, ctx).await
            {
                env.state.write().push_error(ErrorEntry::new(
                    ErrorCode::Hook,
                    error.to_string(),
                    Some(result_id.clone()),
                ));
                body_result = Some(StepResult::skipped(result_id.clone(), "pre-hook failed"));
            }
        }

        // A composite whose body never runs still accounts for its leaves.
        if let Some(early) = &body_result {
            if !step.is_leaf() {
                let reason = if early.status == StepStatus::Skipped {
                    "pre-hook failed"
                } else {
                    "pre-step processing failed"
                };
                mark_leaves_skipped(step, ctx, env, suffix, reason).await;
            }
        }

        // 4. The body.
        let body_ran = body_result.is_none();
        let mut result = match body_result {
            Some(result) => result,
            None => match step.body() {
                StepBody::Leaf => {
                    let (result, leaf_attempts, code) =
                        run_leaf(registry, step, &result_id, ctx, env).await;
                    attempts = leaf_attempts;
                    code_override = code;
                    result
                }
                StepBody::Sequence(children) => {
                    let all_ok = run_sequence(registry, children, ctx, env, suffix).await;
                    composite_result(&result_id, all_ok, json!({"children": children.len()}))
                }
                StepBody::Parallel(group) => {
                    run_parallel(registry, group, &result_id, ctx, env, suffix).await
                }
                StepBody::Loop(spec) => {
                    run_loop(registry, spec, &result_id, ctx, env, suffix).await
                }
            },
        };

        // 5. Post-processors, only over a body that ran.
        if body_ran && !ctx.cancellation.is_cancelled() {
            match run_processors(ProcessorPhase::Post, &step.post_processors, step, ctx).await {
                Ok(list) => assertions.extend(list),
                Err(error) => {
                    if !result.status.is_failure() {
                        result.status = StepStatus::Failed;
                        result.error = Some(error.to_string());
                    }
                    code_override.get_or_insert(error.code());
                }
            }
        }

        if assertions.iter().any(|a| !a.passed) && result.status == StepStatus::Success {
            result.status = StepStatus::Failed;
            result.error = Some(
                assertions
                    .iter()
                    .filter(|a| !a.passed)
                    .map(|a| a.message.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            );
        }
        result.assertions.extend(assertions);

        // 6. Post-hooks always run; failures are recorded, never promoted.
        if let Err(error) =
            run_hooks(&step.post_hooks, HookPoint::StepPost(&step.id), registry, ctx).await
        {
            env.state.write().push_error(ErrorEntry::new(
                ErrorCode::Hook,
                error.to_string(),
                Some(result_id.clone()),
            ));
        }

        finalize(step, result, started, attempts, code_override, ctx, env).await
    })
}

/// Run one leaf with its retry policy, timeout, and concurrency permit.
async fn run_leaf(
    registry: &Arc<ExecutorRegistry>,
    step: &Step,
    result_id: &StepId,
    ctx: &ExecutionContext,
    env: &Arc<ExecEnv>,
) -> (StepResult, u32, Option<ErrorCode>) {
    let executor = match registry.resolve(&step.step_type) {
        Ok(executor) => executor,
        Err(error) => {
            let code = error.code();
            return (
                StepResult::failed(result_id.clone(), error.to_string()),
                1,
                Some(code),
            );
        }
    };
    let canonical = registry
        .canonical_tag(&step.step_type)
        .unwrap_or_else(|_| step.step_type.clone());

    let timeout = step.timeout.or(env.default_timeout);
    let policy = step.retry.clone().unwrap_or_else(RetryPolicy::none);
    let max_attempts = policy.max_attempts.max(1);

    let mut attempt = 1u32;
    loop {
        let delay = policy.delay_for(attempt);
        if !delay.is_zero() {
            let delay = with_jitter(delay, policy.jitter);
            tokio::select! {
                () = ctx.cancellation.cancelled() => {
                    return (StepResult::skipped(result_id.clone(), "aborted"), attempt, None);
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        let permit = tokio::select! {
            () = ctx.cancellation.cancelled() => {
                return (StepResult::skipped(result_id.clone(), "aborted"), attempt, None);
            }
            permit = env.leaf_permits.clone().acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            return (
                StepResult::failed(result_id.clone(), "executor pool closed"),
                attempt,
                Some(ErrorCode::Execution),
            );
        };

        let mut invocation = step.clone();
        invocation.id = result_id.clone();
        let future = executor.execute(&invocation, ctx);

        let (result, code) = match timeout {
            Some(deadline) => tokio::select! {
                () = ctx.cancellation.cancelled() => {
                    return (StepResult::skipped(result_id.clone(), "aborted"), attempt, None);
                }
                outcome = tokio::time::timeout(deadline, future) => match outcome {
                    Err(_) => (StepResult::timeout(result_id.clone(), deadline), None),
                    Ok(Ok(result)) => (result, None),
                    Ok(Err(error)) => {
                        let code = error.code();
                        (StepResult::failed(result_id.clone(), error.to_string()), Some(code))
                    }
                },
            },
            None => tokio::select! {
                () = ctx.cancellation.cancelled() => {
                    return (StepResult::skipped(result_id.clone(), "aborted"), attempt, None);
                }
                outcome = future => match outcome {
                    Ok(result) => (result, None),
                    Err(error) => {
                        let code = error.code();
                        (StepResult::failed(result_id.clone(), error.to_string()), Some(code))
                    }
                },
            },
        };

        if !result.status.is_failure() || attempt >= max_attempts {
            if result.status == StepStatus::Success {
                ctx.set_result(result_id.as_str(), result.output.clone());
                if canonical == "http" {
                    if let Ok(data) =
                        serde_json::from_value::<HttpResponseData>(result.output.clone())
                    {
                        ctx.set_response(data);
                    }
                }
            }
            return (result, attempt, code);
        }

        debug!(step = %result_id, attempt, "step failed, retrying");
        ctx.append_journal(JournalEntry::log(
            result_id.as_str(),
            format!("attempt {attempt} failed, retrying"),
        ));
        attempt += 1;
    }
}

fn with_jitter(delay: Duration, jitter: bool) -> Duration {
    if !jitter {
        return delay;
    }
    use rand::Rng;
    let factor = rand::rng().random_range(0.75..=1.25);
    delay.mul_f64(factor)
}

async fn run_branch<'a>(
    registry: &'a Arc<ExecutorRegistry>,
    child: &'a Step,
    fork: ExecutionContext,
    env: &'a Arc<ExecEnv>,
    suffix: &'a str,
) -> (ExecutionContext, StepResult) {
    let result = dispatch_step(registry, child, &fork, env, suffix).await;
    (fork, result)
}

/// Run a parallel group with bounded fan-out.
///
/// Every branch snapshots variables at group entry; write-sets merge back
/// in completion order. `fail_fast` cancels peers on the first failure.
async fn run_parallel(
    registry: &Arc<ExecutorRegistry>,
    group: &ParallelGroup,
    result_id: &StepId,
    ctx: &ExecutionContext,
    env: &Arc<ExecEnv>,
    suffix: &str,
) -> StepResult {
    let bound = group.max_parallel.unwrap_or(group.steps.len()).max(1);
    let branch_cancel = ctx.cancellation.child_token();

    // All branches snapshot the same group-entry state.
    let forks: Vec<ExecutionContext> = group
        .steps
        .iter()
        .map(|_| ctx.fork(branch_cancel.child_token()))
        .collect();

    let mut failed = 0usize;
    {
        let mut branch_futures = Vec::with_capacity(group.steps.len());
        for (child, fork) in group.steps.iter().zip(forks) {
            branch_futures.push(run_branch(registry, child, fork, env, suffix));
        }
        let mut stream = futures::stream::iter(branch_futures).buffer_unordered(bound);

        while let Some((fork, result)) = stream.next().await {
            // Single writer: apply the branch's writes as it completes.
            ctx.merge_fork(&fork);
            if result.status.is_failure() {
                failed += 1;
                if group.fail_fast {
                    branch_cancel.cancel();
                }
            }
        }
    }

    let mut result = composite_result(
        result_id,
        failed == 0,
        json!({"branches": group.steps.len(), "failed": failed}),
    );
    if failed > 0 {
        result.error = Some(format!("{failed} parallel branch(es) failed"));
    }
    result
}

/// Run a loop body for `count`/`over`/`while` iteration sources.
async fn run_loop(
    registry: &Arc<ExecutorRegistry>,
    spec: &LoopSpec,
    result_id: &StepId,
    ctx: &ExecutionContext,
    env: &Arc<ExecEnv>,
    suffix: &str,
) -> StepResult {
    // Resolve the iteration source at loop entry.
    let items: Option<Vec<serde_json::Value>> = match (&spec.count, &spec.over) {
        (Some(_), _) => None,
        (None, Some(over)) => {
            let resolved = trellis_expression::resolve_value(&ctx.scope(), over);
            match resolved {
                serde_json::Value::Array(items) => Some(items),
                other => {
                    return finalize_error_result(
                        result_id,
                        format!("loop over: expected an array, got {other}"),
                    );
                }
            }
        }
        (None, None) => None, // while-loop
    };

    let fixed_total: Option<u64> = spec
        .count
        .or_else(|| items.as_ref().map(|items| items.len() as u64));
    let body_leaves: u64 = spec.steps.iter().map(|s| s.leaf_count() as u64).sum();
    let variable = spec.variable_name();

    if let Some(workers) = spec.parallel_workers.filter(|w| *w > 1) {
        if let Some(total) = fixed_total {
            return run_loop_parallel(
                registry, spec, result_id, ctx, env, suffix, items, total, workers, body_leaves,
            )
            .await;
        }
        // `while` cannot plan ahead; fall through to sequential.
    }

    let mut iteration: u64 = 0;
    let mut failed_iterations: u64 = 0;
    loop {
        if ctx.cancellation.is_cancelled() {
            break;
        }
        match fixed_total {
            Some(total) => {
                if iteration >= total {
                    break;
                }
            }
            None => {
                if iteration >= spec.max_iterations {
                    warn!(step = %result_id, limit = spec.max_iterations, "while-loop hit max_iterations");
                    break;
                }
                let condition = spec.while_cond.as_deref().unwrap_or("false");
                match trellis_expression::evaluate(condition, &ctx.scope()) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(error) => {
                        return finalize_error_result(
                            result_id,
                            format!("loop while: {error}"),
                        );
                    }
                }
            }
        }

        if iteration > 0 && env.progress_by_steps {
            env.state.write().total_steps += body_leaves;
        }

        let iter_ctx = if spec.iteration_local {
            ctx.fork(ctx.cancellation.child_token())
        } else {
            ctx.clone()
        };
        let item = items
            .as_ref()
            .and_then(|items| items.get(iteration as usize))
            .cloned()
            .unwrap_or(serde_json::Value::from(iteration));
        iter_ctx.set_variable(variable, item, VarScope::Temp, format!("loop:{result_id}"));
        iter_ctx.set_variable(
            "index",
            serde_json::Value::from(iteration),
            VarScope::Temp,
            format!("loop:{result_id}"),
        );

        let iteration_suffix = format!("{suffix}[{iteration}]");
        let ok = run_sequence(registry, &spec.steps, &iter_ctx, env, &iteration_suffix).await;
        // Iteration-local forks are dropped without merging.

        iteration += 1;
        if !ok {
            failed_iterations += 1;
            if spec.break_on_error {
                break;
            }
        }
    }

    loop_result(result_id, iteration, failed_iterations)
}

/// Fixed-size loops with `parallel_workers`: iterations run on a bounded,
/// ordered stream, and write-sets merge back in iteration order.
#[allow(clippy::too_many_arguments)]
async fn run_loop_parallel(
    registry: &Arc<ExecutorRegistry>,
    spec: &LoopSpec,
    result_id: &StepId,
    ctx: &ExecutionContext,
    env: &Arc<ExecEnv>,
    suffix: &str,
    items: Option<Vec<serde_json::Value>>,
    total: u64,
    workers: usize,
    body_leaves: u64,
) -> StepResult {
    if env.progress_by_steps && total > 1 {
        env.state.write().total_steps += body_leaves * (total - 1);
    }

    let variable = spec.variable_name();
    let items = items.unwrap_or_default();
    let mut failed_iterations = 0u64;
    let mut completed = 0u64;

    let mut stream = futures::stream::iter((0..total).map(|iteration| {
        let fork = ctx.fork(ctx.cancellation.child_token());
        let item = items
            .get(iteration as usize)
            .cloned()
            .unwrap_or(serde_json::Value::from(iteration));
        fork.set_variable(variable, item, VarScope::Temp, format!("loop:{result_id}"));
        fork.set_variable(
            "index",
            serde_json::Value::from(iteration),
            VarScope::Temp,
            format!("loop:{result_id}"),
        );
        let iteration_suffix = format!("{suffix}[{iteration}]");
        async move {
            let ok = run_sequence(registry, &spec.steps, &fork, env, &iteration_suffix).await;
            (fork, ok)
        }
    }))
    .buffered(workers);

    while let Some((fork, ok)) = stream.next().await {
        completed += 1;
        if !spec.iteration_local {
            ctx.merge_fork(&fork);
        }
        if !ok {
            failed_iterations += 1;
            if spec.break_on_error {
                break;
            }
        }
    }
    drop(stream);

    loop_result(result_id, completed, failed_iterations)
}

fn loop_result(result_id: &StepId, iterations: u64, failed: u64) -> StepResult {
    let mut result = composite_result(
        result_id,
        failed == 0,
        json!({"iterations": iterations, "failed": failed}),
    );
    if failed > 0 {
        result.error = Some(format!("{failed} iteration(s) failed"));
    }
    result
}

fn composite_result(result_id: &StepId, ok: bool, output: serde_json::Value) -> StepResult {
    let mut result = StepResult::new(
        result_id.clone(),
        if ok { StepStatus::Success } else { StepStatus::Failed },
    );
    result.output = output;
    result
}

fn finalize_error_result(result_id: &StepId, message: String) -> StepResult {
    StepResult::failed(result_id.clone(), message)
}

/// Skip a step (and everything under it), emitting per-leaf events.
async fn skip_step(
    step: &Step,
    result_id: &StepId,
    ctx: &ExecutionContext,
    env: &Arc<ExecEnv>,
    suffix: &str,
    reason: &str,
) -> StepResult {
    mark_leaves_skipped(step, ctx, env, suffix, reason).await;
    if !step.is_leaf() {
        env.callback
            .step_skipped(env.execution_id, result_id, reason)
            .await;
    }
    StepResult::skipped(result_id.clone(), reason)
}

/// Record every leaf under `step` as skipped.
pub(crate) fn mark_leaves_skipped<'a>(
    step: &'a Step,
    ctx: &'a ExecutionContext,
    env: &'a Arc<ExecEnv>,
    suffix: &'a str,
    reason: &'a str,
) -> BoxFuture<'a, ()> {
    Box::pin(async move {
        match step.body() {
            StepBody::Leaf => {
                let result_id = StepId::new(format!("{}{suffix}", step.id));
                {
                    let mut state = env.state.write();
                    state.record_step(StepStatus::Skipped);
                    if env.progress_by_steps {
                        let progress = progress_of(&state);
                        state.advance_progress(progress);
                    }
                }
                ctx.append_journal(JournalEntry::StepFinished {
                    step_id: result_id.clone(),
                    status: StepStatus::Skipped,
                    attempts: 0,
                    at: chrono::Utc::now(),
                });
                env.callback
                    .step_skipped(env.execution_id, &result_id, reason)
                    .await;
            }
            StepBody::Sequence(children) => {
                for child in children {
                    mark_leaves_skipped(child, ctx, env, suffix, reason).await;
                }
            }
            StepBody::Parallel(group) => {
                for child in &group.steps {
                    mark_leaves_skipped(child, ctx, env, suffix, reason).await;
                }
            }
            StepBody::Loop(spec) => {
                for child in &spec.steps {
                    mark_leaves_skipped(child, ctx, env, suffix, reason).await;
                }
            }
        }
    })
}

fn progress_of(state: &ExecutionState) -> f64 {
    if state.total_steps == 0 {
        return 0.0;
    }
    state.finished_steps() as f64 / state.total_steps as f64
}

/// Record a finished step: journal, counters, metrics, events, errors.
async fn finalize(
    step: &Step,
    result: StepResult,
    started: Instant,
    attempts: u32,
    code_override: Option<ErrorCode>,
    ctx: &ExecutionContext,
    env: &Arc<ExecEnv>,
) -> StepResult {
    let mut result = result;
    if result.duration.is_zero() {
        result.duration = started.elapsed();
    }

    ctx.append_journal(JournalEntry::StepFinished {
        step_id: result.step_id.clone(),
        status: result.status,
        attempts,
        at: chrono::Utc::now(),
    });

    if step.is_leaf() {
        env.metrics.record_step(
            result.step_id.as_str(),
            result.status == StepStatus::Success,
            result.duration,
        );
        for (name, value) in &result.metrics {
            env.metrics
                .record_custom(&format!("{}.{name}", result.step_id), *value);
        }

        let progress = {
            let mut state = env.state.write();
            state.record_step(result.status);
            if result.status.is_failure() {
                let code = code_override.unwrap_or(match result.status {
                    StepStatus::Timeout => ErrorCode::Timeout,
                    _ => ErrorCode::Execution,
                });
                state.push_error(ErrorEntry::new(
                    code,
                    result
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("step {} failed", result.step_id)),
                    Some(result.step_id.clone()),
                ));
            }
            if env.progress_by_steps {
                let progress = progress_of(&state);
                state.advance_progress(progress);
            }
            state.progress
        };
        if env.progress_by_steps {
            env.callback.progress(env.execution_id, progress).await;
        }
    }

    match result.status {
        StepStatus::Skipped => {
            let reason = result.error.clone().unwrap_or_else(|| "skipped".into());
            env.callback
                .step_skipped(env.execution_id, &result.step_id, &reason)
                .await;
        }
        _ => {
            env.callback.step_complete(env.execution_id, &result).await;
        }
    }
    result
}
