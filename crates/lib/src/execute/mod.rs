//! Plan execution.
//!
//! This module runs an [`ExecutionPlan`] wave by wave:
//! - Steps of a wave are dispatched in lexicographic id order, bounded by a
//!   semaphore (`max_concurrency`)
//! - Every dispatched step of a wave finishes before the next wave starts
//! - Fail-fast stops dispatching after the first failure; otherwise only the
//!   dependents of a failed step are skipped
//! - Cancellation stops running steps and skips the rest

pub mod runner;
pub mod step;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::plan::ExecutionPlan;

pub use runner::{CommandOutput, CommandRunner, CommandSpec, ShellRunner};
pub use step::{StepContext, compute_cache_key, execute_step};
pub use types::{BatchReport, BatchStatus, ExecuteConfig, ExecuteError, StepError, StepResult, StepStatus};

const REASON_CANCELLED: &str = "cancelled";
const REASON_UPSTREAM: &str = "upstream failure";
const REASON_ABORTED: &str = "run aborted after store failure";

/// Run every step of `plan`.
///
/// `ctx.cancel` is the run token: cancelling it stops running steps
/// (`Cancelled`) and skips everything not yet started. Every step of the plan
/// appears in the report.
///
/// # Errors
///
/// Returns [`ExecuteError::Infrastructure`] when a store operation fails. The
/// remaining steps are cancelled before returning.
pub async fn run_plan(plan: &ExecutionPlan, config: &ExecuteConfig, ctx: StepContext) -> Result<BatchReport, ExecuteError> {
  let start = Instant::now();
  info!(
    run = %ctx.run_id,
    steps = plan.len(),
    waves = plan.waves.len(),
    max_concurrency = config.max_concurrency,
    fail_fast = config.fail_fast,
    "starting run"
  );

  // `user` is the caller's token. `run` adds store failures; running steps
  // watch it. `dispatch` adds fail-fast and only gates new dispatches.
  let user = ctx.cancel.clone();
  let run = user.child_token();
  let dispatch = run.child_token();
  let step_ctx = StepContext {
    cancel: run.clone(),
    default_timeout: config.default_step_timeout,
    ..ctx
  };

  let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
  let mut results: HashMap<String, StepResult> = HashMap::new();
  let mut not_succeeded: HashSet<String> = HashSet::new();
  let mut infra_error: Option<ExecuteError> = None;

  let skip_reason = || {
    if user.is_cancelled() {
      REASON_CANCELLED
    } else if run.is_cancelled() {
      REASON_ABORTED
    } else {
      REASON_UPSTREAM
    }
  };

  for (wave_idx, wave) in plan.waves.iter().enumerate() {
    debug!(wave = wave_idx, steps = wave.len(), "executing wave");

    // Partition wave into ready and skipped
    let mut ready = Vec::new();
    for id in wave {
      if dispatch.is_cancelled() {
        results.insert(id.clone(), StepResult::skipped(id, wave_idx, skip_reason()));
        not_succeeded.insert(id.clone());
        continue;
      }

      let step = &plan.steps[id];
      if let Some(dep) = step.depends_on.iter().find(|d| not_succeeded.contains(*d)) {
        warn!(step = %id, failed_dep = %dep, "skipping step due to failed dependency");
        results.insert(
          id.clone(),
          StepResult::skipped(id, wave_idx, format!("dependency '{}' did not succeed", dep)),
        );
        not_succeeded.insert(id.clone());
        continue;
      }

      ready.push(id);
    }

    // Dispatch in order; acquiring the permit here keeps start order sorted
    let mut join_set = JoinSet::new();
    let mut task_ids: HashMap<tokio::task::Id, String> = HashMap::new();

    for (pos, id) in ready.iter().enumerate() {
      let permit = tokio::select! {
        biased;
        _ = dispatch.cancelled() => None,
        permit = semaphore.clone().acquire_owned() => permit.ok(),
      };

      let Some(permit) = permit else {
        for id in &ready[pos..] {
          results.insert((*id).clone(), StepResult::skipped(*id, wave_idx, skip_reason()));
          not_succeeded.insert((*id).clone());
        }
        break;
      };

      let step = plan.steps[*id].clone();
      let step_ctx = step_ctx.clone();
      let run = run.clone();
      let dispatch = dispatch.clone();
      let fail_fast = config.fail_fast;

      let handle = join_set.spawn(async move {
        let _permit = permit;
        let outcome = execute_step(&step, wave_idx, &step_ctx).await;
        match &outcome {
          Err(_) => run.cancel(),
          Ok(result) if fail_fast && result.status.is_failure() => dispatch.cancel(),
          Ok(_) => {}
        }
        outcome
      });
      task_ids.insert(handle.id(), (*id).clone());
    }

    // Wave barrier
    while let Some(joined) = join_set.join_next_with_id().await {
      let (id, outcome) = match joined {
        Ok((task_id, outcome)) => (task_ids.remove(&task_id).unwrap_or_default(), outcome),
        Err(e) => {
          let id = task_ids.remove(&e.id()).unwrap_or_default();
          error!(step = %id, error = %e, "step task failed");
          if config.fail_fast {
            dispatch.cancel();
          }
          let mut failed = StepResult::new(id.clone(), wave_idx, StepStatus::Failed);
          failed.reason = Some(format!("step task failed: {}", e));
          not_succeeded.insert(id.clone());
          results.insert(id, failed);
          continue;
        }
      };

      match outcome {
        Ok(result) => {
          if !result.succeeded() {
            not_succeeded.insert(id.clone());
          }
          results.insert(id, result);
        }
        Err(source) => {
          error!(step = %id, error = %source, "store failure, aborting run");
          let mut failed = StepResult::new(id.clone(), wave_idx, StepStatus::Failed);
          failed.reason = Some(source.to_string());
          not_succeeded.insert(id.clone());
          results.insert(id.clone(), failed);
          infra_error.get_or_insert(ExecuteError::Infrastructure { step: id, source });
        }
      }
    }
  }

  if let Some(err) = infra_error {
    return Err(err);
  }

  let steps: Vec<StepResult> = plan
    .ordered_ids()
    .map(|id| {
      results
        .remove(id)
        .unwrap_or_else(|| StepResult::skipped(id, plan.wave_of(id).unwrap_or(0), skip_reason()))
    })
    .collect();

  let status = if user.is_cancelled() || steps.iter().any(|s| s.status == StepStatus::Cancelled) {
    BatchStatus::Cancelled
  } else if steps.iter().all(StepResult::succeeded) {
    BatchStatus::Succeeded
  } else {
    BatchStatus::Failed
  };

  let report = BatchReport {
    run_id: step_ctx.run_id.clone(),
    status,
    waves: plan.waves.clone(),
    steps,
    duration: start.elapsed(),
  };

  let counts: BTreeMap<&str, usize> = [
    StepStatus::Succeeded,
    StepStatus::Failed,
    StepStatus::TimedOut,
    StepStatus::Skipped,
    StepStatus::Cancelled,
  ]
  .into_iter()
  .map(|s| (s.as_str(), report.count(s)))
  .collect();

  info!(
    run = %report.run_id,
    status = %report.status,
    cache_hits = report.cache_hits(),
    ?counts,
    duration_ms = report.duration.as_millis() as u64,
    "run complete"
  );

  Ok(report)
}
