//! The virtual-user pool for performance mode.
//!
//! Each VU is a worker looping full workflow iterations on an isolated
//! context fork. Scale commands retarget the pool; workers spawn on demand
//! and retire at their next iteration boundary. Stages drive the target
//! over time. The run ends when the duration elapses, the iteration budget
//! is spent, or the execution is stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use trellis_workflow::Workflow;

use crate::context::ExecutionContext;
use crate::executor::ExecutorRegistry;
use crate::kernel::{ExecEnv, run_sequence};

/// Drive a performance-mode run to completion.
pub(crate) async fn run_load(
    registry: &Arc<ExecutorRegistry>,
    workflow: &Arc<Workflow>,
    ctx: &ExecutionContext,
    env: &Arc<ExecEnv>,
) {
    let options = &workflow.options;
    let initial_target = if options.stages.is_empty() {
        options.vus.unwrap_or(1).max(1)
    } else {
        options.stages[0].target_vus.max(1)
    };

    let total_duration: Option<Duration> = if options.stages.is_empty() {
        options.duration
    } else {
        Some(options.stages.iter().map(|s| s.duration).sum())
    };
    // With no bound at all, each VU runs one iteration.
    let iteration_budget: Option<u64> = if total_duration.is_none() {
        Some(
            options
                .iterations
                .unwrap_or_else(|| u64::from(initial_target)),
        )
    } else {
        options.iterations
    };

    let stop = CancellationToken::new();
    let started = Instant::now();
    let iterations_started = Arc::new(AtomicU64::new(0));
    let active_workers = Arc::new(AtomicU32::new(0));

    let mut workers: JoinSet<()> = JoinSet::new();
    let mut spawn_to_target = |target: u32, workers: &mut JoinSet<()>| {
        let current = active_workers.load(Ordering::SeqCst);
        for _ in current..target {
            active_workers.fetch_add(1, Ordering::SeqCst);
            workers.spawn(vu_worker(
                Arc::clone(registry),
                Arc::clone(workflow),
                ctx.clone(),
                Arc::clone(env),
                stop.clone(),
                Arc::clone(&iterations_started),
                Arc::clone(&active_workers),
                iteration_budget,
            ));
        }
    };
    spawn_to_target(initial_target, &mut workers);
    let _ = env.scale.send(initial_target);

    info!(
        execution = %env.execution_id,
        vus = initial_target,
        ?total_duration,
        ?iteration_budget,
        "load run started"
    );

    let mut scale_rx = env.scale.subscribe();
    let schedule = schedule_driver(env, &options.stages, total_duration);
    tokio::pin!(schedule);
    let mut progress_tick = tokio::time::interval(Duration::from_millis(500));
    progress_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        // Every worker retired with nothing left to schedule: budget spent.
        if active_workers.load(Ordering::SeqCst) == 0 {
            break;
        }
        tokio::select! {
            () = env.cancel.cancelled() => break,
            () = &mut schedule => break,
            changed = scale_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let target = *scale_rx.borrow_and_update();
                debug!(execution = %env.execution_id, target, "scaling virtual users");
                spawn_to_target(target, &mut workers);
            }
            _ = progress_tick.tick() => {
                update_progress(
                    env,
                    started,
                    total_duration,
                    iteration_budget,
                    &iterations_started,
                ).await;
            }
        }
    }

    stop.cancel();
    while workers.join_next().await.is_some() {}
    update_progress(env, started, total_duration, iteration_budget, &iterations_started).await;
    info!(
        execution = %env.execution_id,
        iterations = iterations_started.load(Ordering::SeqCst),
        "load run finished"
    );
}

/// Sleeps through the stage plan (retargeting the pool at each boundary)
/// or the flat duration; pends forever for iteration-bounded runs.
async fn schedule_driver(
    env: &Arc<ExecEnv>,
    stages: &[trellis_workflow::Stage],
    total_duration: Option<Duration>,
) {
    if stages.is_empty() {
        match total_duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
        return;
    }
    for stage in stages {
        let _ = env.scale.send(stage.target_vus.max(1));
        tokio::time::sleep(stage.duration).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn vu_worker(
    registry: Arc<ExecutorRegistry>,
    workflow: Arc<Workflow>,
    base: ExecutionContext,
    env: Arc<ExecEnv>,
    stop: CancellationToken,
    iterations_started: Arc<AtomicU64>,
    active_workers: Arc<AtomicU32>,
    iteration_budget: Option<u64>,
) {
    loop {
        if stop.is_cancelled() || env.cancel.is_cancelled() {
            break;
        }
        // Retire at the iteration boundary when the pool is over target.
        let target = *env.scale.borrow();
        let current = active_workers.load(Ordering::SeqCst);
        if current > target
            && active_workers
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return;
        }

        if let Some(budget) = iteration_budget {
            if iterations_started.fetch_add(1, Ordering::SeqCst) >= budget {
                break;
            }
        }

        env.gate.wait_open().await;
        if env.cancel.is_cancelled() {
            break;
        }

        let iteration_ctx = base.fork_isolated(env.cancel.child_token());
        run_sequence(&registry, &workflow.steps, &iteration_ctx, &env, "").await;
    }
    active_workers.fetch_sub(1, Ordering::SeqCst);
}

async fn update_progress(
    env: &Arc<ExecEnv>,
    started: Instant,
    total_duration: Option<Duration>,
    iteration_budget: Option<u64>,
    iterations_started: &Arc<AtomicU64>,
) {
    let progress = if let Some(duration) = total_duration {
        (started.elapsed().as_secs_f64() / duration.as_secs_f64()).min(1.0)
    } else if let Some(budget) = iteration_budget {
        if budget == 0 {
            1.0
        } else {
            (iterations_started.load(Ordering::SeqCst).min(budget) as f64) / budget as f64
        }
    } else {
        0.0
    };
    let progress = (progress * 0.999).min(0.999); // terminal status pins 1.0
    env.state.write().advance_progress(progress);
    env.callback.progress(env.execution_id, progress).await;
}
