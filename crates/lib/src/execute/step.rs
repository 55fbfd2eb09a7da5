//! Execution of a single concrete step.
//!
//! Order of operations:
//! 1. Compute the cache key (cacheable steps only) and pin it
//! 2. On a cache hit, restore the cached bundle and skip the commands
//! 3. Otherwise run the command units in order, each attempt bounded by the
//!    step timeout, retrying per the step's policy
//! 4. On success, store the cache bundle and the declared artifacts

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::runner::{CommandRunner, CommandSpec};
use super::types::{StepError, StepResult, StepStatus};
use crate::consts::{ATTEMPT_ENV, PRIMARY_ARTIFACT, RUN_ID_ENV, STEP_ID_ENV};
use crate::plan::ConcreteStep;
use crate::store::bundle::{create_bundle, unpack_bundle};
use crate::store::{ArtifactKey, ArtifactRef, ArtifactStore, CacheStore, StoreError};
use crate::util::glob;
use crate::util::hash::{ContentHash, hash_bytes, hash_files};

/// Lines of command output kept in a failure reason.
const OUTPUT_TAIL_LINES: usize = 20;

/// Everything a step needs besides its definition.
#[derive(Clone)]
pub struct StepContext {
  pub runner: Arc<dyn CommandRunner>,
  pub cache: Arc<CacheStore>,
  pub artifacts: Arc<ArtifactStore>,

  /// Root that relative paths (working dir, cache and artifact patterns)
  /// resolve against.
  pub workspace: PathBuf,

  pub run_id: String,

  /// Timeout for steps that don't declare one. `run_plan` replaces it with
  /// [`ExecuteConfig::default_step_timeout`](super::ExecuteConfig).
  pub default_timeout: Duration,

  /// Run-level cancellation.
  pub cancel: CancellationToken,
}

#[derive(Serialize)]
struct CacheFingerprint<'a> {
  step: &'a str,
  commands: &'a [String],
  env: &'a std::collections::BTreeMap<String, String>,
  cache_paths: &'a [String],
  cache_inputs: &'a [String],
  inputs_digest: &'a ContentHash,
}

/// Cache key of a step: its fingerprint plus the content of its cache inputs.
///
/// Any change to the commands, env (including matrix values), declared cache
/// paths, or the content of files matched by `cache_inputs` changes the key.
pub fn compute_cache_key(step: &ConcreteStep, workspace: &Path) -> Result<ContentHash, StepError> {
  let inputs = glob::expand(workspace, &step.cache_inputs)?;
  let inputs_digest = hash_files(workspace, &inputs)?;

  let fingerprint = CacheFingerprint {
    step: &step.id,
    commands: &step.commands,
    env: &step.env,
    cache_paths: &step.cache_paths,
    cache_inputs: &step.cache_inputs,
    inputs_digest: &inputs_digest,
  };
  let serialized = serde_json::to_vec(&fingerprint).map_err(|e| StepError::CacheKey(e.to_string()))?;
  Ok(hash_bytes(&serialized))
}

/// Run one step to a terminal state.
///
/// Step failures are captured in the returned [`StepResult`]. A store failure
/// is returned as `Err`: the store is unusable and the run must stop.
pub async fn execute_step(step: &ConcreteStep, wave: usize, ctx: &StepContext) -> Result<StepResult, StoreError> {
  let start = Instant::now();
  let mut result = StepResult::new(step.id.clone(), wave, StepStatus::Succeeded);

  let outcome = run_to_completion(step, ctx, &mut result).await;
  result.duration = start.elapsed();

  match outcome {
    Ok(Ok(())) => {
      info!(
        step = %step.id,
        attempts = result.attempts,
        cache_hit = result.cache_hit,
        duration_ms = result.duration.as_millis() as u64,
        "step succeeded"
      );
      Ok(result)
    }
    Ok(Err(e)) => {
      result.status = match e {
        StepError::TimedOut(_) => StepStatus::TimedOut,
        StepError::Cancelled => StepStatus::Cancelled,
        _ => StepStatus::Failed,
      };
      result.reason = Some(failure_reason(&e));
      match result.status {
        StepStatus::Cancelled => info!(step = %step.id, "step cancelled"),
        _ => warn!(step = %step.id, status = %result.status, error = %e, "step did not succeed"),
      }
      Ok(result)
    }
    Err(e) => Err(e),
  }
}

fn failure_reason(e: &StepError) -> String {
  match e {
    StepError::CommandFailed { output, .. } if !output.is_empty() => format!("{}\n{}", e, output),
    _ => e.to_string(),
  }
}

/// Outer `Result` is infrastructure, inner is the step's own outcome.
async fn run_to_completion(
  step: &ConcreteStep,
  ctx: &StepContext,
  result: &mut StepResult,
) -> Result<Result<(), StepError>, StoreError> {
  if ctx.cancel.is_cancelled() {
    return Ok(Err(StepError::Cancelled));
  }

  let cache_key = if step.is_cacheable() {
    match compute_cache_key(step, &ctx.workspace) {
      Ok(key) => Some(key),
      Err(e) => return Ok(Err(e)),
    }
  } else {
    None
  };
  result.cache_key = cache_key.clone();

  // Held until the step finishes so eviction cannot drop the entry mid-run
  let _pin = cache_key.as_ref().map(|key| ctx.cache.pin(key));

  if let Some(key) = &cache_key
    && let Some(bundle) = ctx.cache.get(key)?
  {
    let restored = unpack_bundle(&bundle, &ctx.workspace)?;
    debug!(step = %step.id, key = %key.short(), files = restored.len(), "restored cache");
    result.cache_hit = true;
    result.artifacts = store_artifacts(step, ctx)?;
    return Ok(Ok(()));
  }

  if let Err(e) = run_with_retry(step, ctx, result).await {
    return Ok(Err(e));
  }

  if let Some(key) = &cache_key {
    let files = match glob::expand(&ctx.workspace, &step.cache_paths) {
      Ok(files) => files,
      Err(e) => return Ok(Err(e.into())),
    };
    let bundle = create_bundle(&ctx.workspace, &files)?;
    let blob = ctx.cache.put(key, &bundle)?;
    debug!(step = %step.id, key = %key.short(), files = files.len(), size = blob.size, "cached step outputs");
  }

  result.artifacts = store_artifacts(step, ctx)?;
  Ok(Ok(()))
}

async fn run_with_retry(step: &ConcreteStep, ctx: &StepContext, result: &mut StepResult) -> Result<(), StepError> {
  let timeout = step.timeout.unwrap_or(ctx.default_timeout);
  let policy = &step.retry;

  loop {
    result.attempts += 1;
    let attempt = result.attempts;

    let err = match run_commands(step, ctx, timeout, attempt).await {
      Ok(()) => return Ok(()),
      Err(e) => e,
    };

    let retryable = match &err {
      StepError::TimedOut(_) => policy.retry_on_timeout,
      StepError::CommandFailed { .. } | StepError::Spawn { .. } => true,
      _ => false,
    };
    if !retryable || attempt > policy.retries {
      return Err(err);
    }

    let delay = policy.delay_for(attempt);
    warn!(
      step = %step.id,
      attempt,
      retries = policy.retries,
      delay_ms = delay.as_millis() as u64,
      error = %err,
      "attempt failed, retrying"
    );

    tokio::select! {
      _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
      _ = tokio::time::sleep(delay) => {}
    }
  }
}

/// Run every command unit once. The timeout bounds the whole attempt.
async fn run_commands(step: &ConcreteStep, ctx: &StepContext, timeout: Duration, attempt: u32) -> Result<(), StepError> {
  let cwd = match &step.working_dir {
    Some(dir) => ctx.workspace.join(dir),
    None => ctx.workspace.clone(),
  };

  let mut env = step.env.clone();
  env.insert(STEP_ID_ENV.to_string(), step.id.clone());
  env.insert(RUN_ID_ENV.to_string(), ctx.run_id.clone());
  env.insert(ATTEMPT_ENV.to_string(), attempt.to_string());

  let deadline = tokio::time::Instant::now() + timeout;

  for (index, command) in step.commands.iter().enumerate() {
    debug!(step = %step.id, index, command = %command, "running command");

    let spec = CommandSpec {
      step_id: &step.id,
      command,
      env: &env,
      cwd: &cwd,
    };

    let output = tokio::select! {
      biased;
      _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
      _ = tokio::time::sleep_until(deadline) => return Err(StepError::TimedOut(timeout)),
      output = ctx.runner.run(spec) => output.map_err(|source| StepError::Spawn {
        command: command.clone(),
        source,
      })?,
    };

    if !output.success() {
      return Err(StepError::CommandFailed {
        index,
        command: command.clone(),
        code: output.code,
        output: output.tail(OUTPUT_TAIL_LINES),
      });
    }
  }

  Ok(())
}

/// Bundle each declared artifact with at least one matching file.
fn store_artifacts(step: &ConcreteStep, ctx: &StepContext) -> Result<Vec<ArtifactRef>, StoreError> {
  let mut outputs: Vec<(&str, &[String])> = Vec::new();
  if !step.artifacts.files.is_empty() {
    outputs.push((PRIMARY_ARTIFACT, &step.artifacts.files));
  }
  for (name, secondary) in &step.artifacts.secondary {
    if !secondary.files.is_empty() {
      outputs.push((name, &secondary.files));
    }
  }

  let mut refs = Vec::new();
  for (name, patterns) in outputs {
    // Patterns were validated at load time, so a failure here is a walk error
    let files = glob::expand(&ctx.workspace, patterns).map_err(|e| StoreError::Bundle(e.to_string()))?;
    if files.is_empty() {
      warn!(step = %step.id, artifact = name, "artifact matched no files");
      continue;
    }

    let bundle = create_bundle(&ctx.workspace, &files)?;
    let key = ArtifactKey::new(&ctx.run_id, &step.id, name);
    refs.push(ctx.artifacts.put(&key, &bundle)?);
  }
  Ok(refs)
}
