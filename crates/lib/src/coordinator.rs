//! Run orchestration.
//!
//! [`run_project`] drives a whole run:
//! 1. Load and validate the project file
//! 2. Filter and expand matrices, schedule waves
//! 3. Lock the store root and open the cache and artifact stores
//! 4. Run the plan, bounded by the project's global timeout
//! 5. Return the [`BatchReport`]
//!
//! Definition errors are reported before the store is touched; store errors
//! abort before any step runs.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::consts::{CACHE_MAX_BYTES_ENV, DEFAULT_CACHE_MAX_BYTES, DEFAULT_STEP_TIMEOUT_SECS};
use crate::execute::{self, BatchReport, CommandRunner, ExecuteConfig, ExecuteError, ShellRunner, StepContext};
use crate::plan::{ExecutionPlan, MatrixSelections, schedule};
use crate::platform::paths::store_dir;
use crate::project::{DefinitionError, ProjectDef};
use crate::store::{ArtifactStore, CacheStore, StoreError};
use crate::store_lock::{LockMode, StoreLock, StoreLockError};

const CACHE_DIR: &str = "cache";
const ARTIFACTS_DIR: &str = "artifacts";

/// A failure that prevents a run from producing a report.
#[derive(Debug, Error)]
pub enum CoordinatorError {
  #[error(transparent)]
  Definition(#[from] DefinitionError),

  #[error(transparent)]
  Infrastructure(#[from] InfrastructureError),
}

/// The store or workspace is unusable.
#[derive(Debug, Error)]
pub enum InfrastructureError {
  #[error(transparent)]
  Lock(#[from] StoreLockError),

  #[error("store unavailable: {0}")]
  Store(#[from] StoreError),

  #[error(transparent)]
  Run(#[from] ExecuteError),

  #[error("workspace {path} is not usable: {source}")]
  Workspace {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid {var}: '{value}' is not a byte count")]
  InvalidCapacity { var: &'static str, value: String },
}

/// Options for a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
  pub max_concurrency: usize,
  pub fail_fast: bool,
  pub matrix: MatrixSelections,

  /// Store root; `None` resolves via `STEPWISE_STORE` and the platform
  /// cache directory.
  pub store_dir: Option<PathBuf>,

  /// Cache capacity; `None` reads `STEPWISE_CACHE_MAX_BYTES`.
  pub cache_max_bytes: Option<u64>,

  pub default_step_timeout: Duration,

  /// Shell override for command units.
  pub shell: Option<String>,

  /// Fixed run id; `None` generates one.
  pub run_id: Option<String>,
}

impl Default for RunOptions {
  fn default() -> Self {
    Self {
      max_concurrency: execute::types::num_cpus(),
      fail_fast: false,
      matrix: MatrixSelections::new(),
      store_dir: None,
      cache_max_bytes: None,
      default_step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
      shell: None,
      run_id: None,
    }
  }
}

impl RunOptions {
  pub fn resolve_store_dir(&self) -> PathBuf {
    self.store_dir.clone().unwrap_or_else(store_dir)
  }

  pub fn resolve_cache_max_bytes(&self) -> Result<u64, InfrastructureError> {
    if let Some(bytes) = self.cache_max_bytes {
      return Ok(bytes);
    }
    cache_max_bytes_from_env()
  }
}

/// Cache capacity from `STEPWISE_CACHE_MAX_BYTES`, else the default.
pub fn cache_max_bytes_from_env() -> Result<u64, InfrastructureError> {
  match std::env::var(CACHE_MAX_BYTES_ENV) {
    Ok(value) => value.trim().parse().map_err(|_| InfrastructureError::InvalidCapacity {
      var: CACHE_MAX_BYTES_ENV,
      value,
    }),
    Err(_) => Ok(DEFAULT_CACHE_MAX_BYTES),
  }
}

/// The opened stores of a store root, held under its lock.
pub struct Stores {
  pub cache: Arc<CacheStore>,
  pub artifacts: Arc<ArtifactStore>,
  _lock: StoreLock,
}

impl Stores {
  /// Lock `root` and open both stores.
  pub fn open(root: &Path, mode: LockMode, command: &str, cache_max_bytes: u64) -> Result<Self, InfrastructureError> {
    let lock = StoreLock::acquire(root, mode, command)?;
    let cache = CacheStore::open(&root.join(CACHE_DIR), cache_max_bytes)?;
    let artifacts = ArtifactStore::open(&root.join(ARTIFACTS_DIR))?;
    Ok(Self {
      cache: Arc::new(cache),
      artifacts: Arc::new(artifacts),
      _lock: lock,
    })
  }
}

/// Unique per process and call: millisecond timestamp, pid, counter.
pub fn generate_run_id() -> String {
  static COUNTER: AtomicU32 = AtomicU32::new(0);
  let millis = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis();
  let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
  format!("{}-{:x}-{}", millis, process::id(), seq)
}

/// Load a project and schedule it without running anything.
pub fn plan_project(path: &Path, selections: &MatrixSelections) -> Result<ExecutionPlan, DefinitionError> {
  let project = ProjectDef::load(path)?;
  schedule(&project, selections)
}

/// Load, schedule and run a project file with the default shell runner.
///
/// The workspace is the directory containing the project file.
pub async fn run_project(
  path: &Path,
  options: &RunOptions,
  cancel: CancellationToken,
) -> Result<BatchReport, CoordinatorError> {
  let project = ProjectDef::load(path)?;
  let workspace = match path.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
    _ => PathBuf::from("."),
  };
  let runner = Arc::new(ShellRunner::new(options.shell.clone()));
  run_project_def(&project, &workspace, options, runner, cancel).await
}

/// Run an already loaded project in `workspace` with `runner`.
pub async fn run_project_def(
  project: &ProjectDef,
  workspace: &Path,
  options: &RunOptions,
  runner: Arc<dyn CommandRunner>,
  cancel: CancellationToken,
) -> Result<BatchReport, CoordinatorError> {
  let plan = schedule(project, &options.matrix)?;

  let workspace = dunce::canonicalize(workspace).map_err(|source| InfrastructureError::Workspace {
    path: workspace.to_path_buf(),
    source,
  })?;

  let store_root = options.resolve_store_dir();
  let stores = Stores::open(
    &store_root,
    LockMode::Exclusive,
    "run",
    options.resolve_cache_max_bytes()?,
  )?;

  let run_id = options.run_id.clone().unwrap_or_else(generate_run_id);
  info!(
    run = %run_id,
    store = %store_root.display(),
    workspace = %workspace.display(),
    "stores ready"
  );

  // Global timeout cancels a child so the caller's token stays untouched
  let run_cancel = cancel.child_token();
  let timer = plan.timeout.map(|limit| {
    let token = run_cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(limit).await;
      warn!(timeout = %humantime::format_duration(limit), "global run timeout reached, cancelling");
      token.cancel();
    })
  });

  let ctx = StepContext {
    runner,
    cache: stores.cache.clone(),
    artifacts: stores.artifacts.clone(),
    workspace,
    run_id,
    default_timeout: options.default_step_timeout,
    cancel: run_cancel,
  };
  let config = ExecuteConfig {
    max_concurrency: options.max_concurrency,
    fail_fast: options.fail_fast,
    default_step_timeout: options.default_step_timeout,
  };

  let result = execute::run_plan(&plan, &config, ctx).await;

  if let Some(timer) = timer {
    timer.abort();
  }
  drop(stores);

  result.map_err(|e| CoordinatorError::Infrastructure(e.into()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::execute::StepStatus;
  use crate::execute::testing::ScriptedRunner;
  use crate::project::Format;
  use serial_test::serial;
  use std::time::Duration;
  use tempfile::TempDir;

  fn project(yaml: &str) -> ProjectDef {
    ProjectDef::parse(yaml, Format::Yaml, Path::new("test.yaml")).unwrap()
  }

  fn options(temp: &TempDir) -> RunOptions {
    RunOptions {
      max_concurrency: 2,
      store_dir: Some(temp.path().join("store")),
      cache_max_bytes: Some(1024 * 1024),
      ..Default::default()
    }
  }

  fn workspace(temp: &TempDir) -> PathBuf {
    let dir = temp.path().join("workspace");
    std::fs::create_dir_all(&dir).unwrap();
    dir
  }

  #[tokio::test]
  async fn runs_project_end_to_end() {
    let temp = TempDir::new().unwrap();
    let runner = ScriptedRunner::new().writes("build", "dist/app", "bin");
    let project = project(
      r#"
artifacts: { files: ["dist/**"] }
steps:
  build: { commands: [build] }
"#,
    );

    let mut opts = options(&temp);
    opts.run_id = Some("run-1".to_string());
    let report = run_project_def(
      &project,
      &workspace(&temp),
      &opts,
      Arc::new(runner),
      CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(report.is_success());
    assert_eq!(report.run_id, "run-1");
    assert!(temp.path().join("store/artifacts/run-1/build/primary.tar").exists());
  }

  #[tokio::test]
  async fn cycle_never_invokes_the_runner() {
    let temp = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let project = project("steps: { a: { commands: [a], depends_on: [b] }, b: { commands: [b], depends_on: [a] } }");

    let err = run_project_def(
      &project,
      &workspace(&temp),
      &options(&temp),
      Arc::new(runner.clone()),
      CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, CoordinatorError::Definition(DefinitionError::Cycle(_))));
    assert!(runner.commands().is_empty());
    assert!(!temp.path().join("store").exists());
  }

  #[tokio::test]
  async fn locked_store_aborts_before_execution() {
    let temp = TempDir::new().unwrap();
    let opts = options(&temp);
    let _held = StoreLock::acquire(&opts.resolve_store_dir(), LockMode::Exclusive, "other").unwrap();

    let runner = ScriptedRunner::new();
    let err = run_project_def(
      &project("steps: { a: { commands: [a] } }"),
      &workspace(&temp),
      &opts,
      Arc::new(runner.clone()),
      CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
      err,
      CoordinatorError::Infrastructure(InfrastructureError::Lock(_))
    ));
    assert!(runner.commands().is_empty());
  }

  #[tokio::test]
  async fn missing_workspace_is_infrastructure_error() {
    let temp = TempDir::new().unwrap();
    let err = run_project_def(
      &project("steps: {}"),
      &temp.path().join("nope"),
      &options(&temp),
      Arc::new(ScriptedRunner::new()),
      CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
      err,
      CoordinatorError::Infrastructure(InfrastructureError::Workspace { .. })
    ));
  }

  #[tokio::test]
  async fn global_timeout_cancels_the_run() {
    let temp = TempDir::new().unwrap();
    let runner = ScriptedRunner::new().delay_on("slow", Duration::from_secs(30));
    let project = project(
      r#"
timeout: 100ms
steps:
  slow: { commands: [slow] }
  later: { commands: [later], depends_on: [slow] }
"#,
    );

    let cancel = CancellationToken::new();
    let report = run_project_def(&project, &workspace(&temp), &options(&temp), Arc::new(runner), cancel.clone())
      .await
      .unwrap();

    assert_eq!(report.get("slow").unwrap().status, StepStatus::Cancelled);
    assert_eq!(report.get("later").unwrap().status, StepStatus::Skipped);
    assert!(!cancel.is_cancelled());
  }

  #[tokio::test]
  async fn matrix_filter_limits_run() {
    let temp = TempDir::new().unwrap();
    let runner = ScriptedRunner::new();
    let project = project("steps: { test: { commands: [t], matrix: { os: [linux, mac, windows] } } }");

    let mut opts = options(&temp);
    opts.matrix = MatrixSelections::parse(&["os=mac"]).unwrap();
    let report = run_project_def(&project, &workspace(&temp), &opts, Arc::new(runner.clone()), CancellationToken::new())
      .await
      .unwrap();

    assert_eq!(report.total(), 1);
    assert_eq!(report.steps[0].id, "test#os=mac");
    assert_eq!(runner.commands(), vec!["test#os=mac: t"]);
  }

  #[test]
  fn run_ids_are_unique() {
    let a = generate_run_id();
    let b = generate_run_id();
    assert_ne!(a, b);
  }

  #[test]
  #[serial]
  fn cache_capacity_from_env() {
    temp_env::with_var(CACHE_MAX_BYTES_ENV, Some("1234"), || {
      assert_eq!(RunOptions::default().resolve_cache_max_bytes().unwrap(), 1234);
    });
    temp_env::with_var(CACHE_MAX_BYTES_ENV, Some("lots"), || {
      assert!(RunOptions::default().resolve_cache_max_bytes().is_err());
    });
    temp_env::with_var(CACHE_MAX_BYTES_ENV, None::<&str>, || {
      assert_eq!(
        RunOptions::default().resolve_cache_max_bytes().unwrap(),
        DEFAULT_CACHE_MAX_BYTES
      );
    });
  }

  #[tokio::test]
  async fn run_project_uses_project_directory_as_workspace() {
    let temp = TempDir::new().unwrap();
    let dir = workspace(&temp);
    let file = dir.join("stepwise.yaml");
    std::fs::write(&file, "steps: { noop: {} }").unwrap();

    let report = run_project(&file, &options(&temp), CancellationToken::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.get("noop").unwrap().attempts, 1);
  }
}
