//! Types for step and batch execution.
//!
//! This module defines the error types, result types, and configuration
//! for executing an [`ExecutionPlan`](crate::plan::ExecutionPlan).

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::consts::DEFAULT_STEP_TIMEOUT_SECS;
use crate::store::{ArtifactRef, StoreError};
use crate::util::duration::serialize_millis;
use crate::util::glob::GlobError;
use crate::util::hash::{ContentHash, FileHashError};

/// Terminal state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
  Succeeded,
  Failed,
  Skipped,
  TimedOut,
  Cancelled,
}

impl StepStatus {
  /// Failed or timed out: the statuses that trigger fail-fast.
  pub fn is_failure(self) -> bool {
    matches!(self, StepStatus::Failed | StepStatus::TimedOut)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      StepStatus::Succeeded => "succeeded",
      StepStatus::Failed => "failed",
      StepStatus::Skipped => "skipped",
      StepStatus::TimedOut => "timed_out",
      StepStatus::Cancelled => "cancelled",
    }
  }
}

impl std::fmt::Display for StepStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Why a step failed. Captured into [`StepResult::reason`].
#[derive(Debug, Error)]
pub enum StepError {
  /// A command unit exited unsuccessfully.
  #[error("command {index} {}: {command}", exit_description(*.code))]
  CommandFailed {
    index: usize,
    command: String,
    code: Option<i32>,
    output: String,
  },

  /// A command unit could not be started.
  #[error("failed to spawn command '{command}': {source}")]
  Spawn {
    command: String,
    #[source]
    source: std::io::Error,
  },

  #[error("timed out after {}", humantime::format_duration(*.0))]
  TimedOut(Duration),

  #[error("cancelled")]
  Cancelled,

  #[error("failed to compute cache key: {0}")]
  CacheKey(String),

  #[error(transparent)]
  Glob(#[from] GlobError),

  #[error(transparent)]
  Hash(#[from] FileHashError),
}

fn exit_description(code: Option<i32>) -> String {
  match code {
    Some(code) => format!("exited with code {}", code),
    None => "was terminated by a signal".to_string(),
  }
}

/// A store failure while running a step. Aborts the whole run.
#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error("store failure in step '{step}': {source}")]
  Infrastructure {
    step: String,
    #[source]
    source: StoreError,
  },
}

/// Result of one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
  pub id: String,
  pub status: StepStatus,

  /// Wave the step belonged to.
  pub wave: usize,

  /// Total wall time including retries and backoff.
  #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
  pub duration: Duration,

  /// Command attempts made (0 for cache hits and skipped steps).
  pub attempts: u32,

  pub cache_hit: bool,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub cache_key: Option<ContentHash>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub artifacts: Vec<ArtifactRef>,

  /// Skip reason or failure detail.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
}

impl StepResult {
  pub fn new(id: impl Into<String>, wave: usize, status: StepStatus) -> Self {
    Self {
      id: id.into(),
      status,
      wave,
      duration: Duration::ZERO,
      attempts: 0,
      cache_hit: false,
      cache_key: None,
      artifacts: Vec::new(),
      reason: None,
    }
  }

  pub fn skipped(id: impl Into<String>, wave: usize, reason: impl Into<String>) -> Self {
    Self::new(id, wave, StepStatus::Skipped).with_reason(reason)
  }

  pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
    self.reason = Some(reason.into());
    self
  }

  pub fn succeeded(&self) -> bool {
    self.status == StepStatus::Succeeded
  }
}

/// Overall outcome of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
  Succeeded,
  Failed,
  Cancelled,
}

impl std::fmt::Display for BatchStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      BatchStatus::Succeeded => "succeeded",
      BatchStatus::Failed => "failed",
      BatchStatus::Cancelled => "cancelled",
    })
  }
}

/// Aggregated result of running a plan.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
  pub run_id: String,
  pub status: BatchStatus,
  pub waves: Vec<Vec<String>>,

  /// One entry per concrete step, in plan order.
  pub steps: Vec<StepResult>,

  #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
  pub duration: Duration,
}

impl BatchReport {
  pub fn is_success(&self) -> bool {
    self.status == BatchStatus::Succeeded
  }

  pub fn total(&self) -> usize {
    self.steps.len()
  }

  pub fn count(&self, status: StepStatus) -> usize {
    self.steps.iter().filter(|s| s.status == status).count()
  }

  pub fn cache_hits(&self) -> usize {
    self.steps.iter().filter(|s| s.cache_hit).count()
  }

  pub fn get(&self, id: &str) -> Option<&StepResult> {
    self.steps.iter().find(|s| s.id == id)
  }
}

/// Configuration for plan execution.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of steps running at once.
  pub max_concurrency: usize,

  /// Stop dispatching new steps after the first failure.
  pub fail_fast: bool,

  /// Timeout for steps that don't declare one.
  pub default_step_timeout: Duration,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      max_concurrency: num_cpus(),
      fail_fast: false,
      default_step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
    }
  }
}

/// Get the number of CPUs for default concurrency.
pub fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
