//! Scripted command runner for executor and scheduler tests.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::runner::{CommandOutput, CommandRunner, CommandSpec};
use super::step::StepContext;
use crate::store::{ArtifactStore, CacheStore};

#[derive(Default)]
struct Script {
  fail: HashMap<String, usize>,
  delay: HashMap<String, Duration>,
  writes: HashMap<String, Vec<(String, String)>>,
}

#[derive(Default)]
struct Inner {
  script: Script,
  log: Mutex<Vec<String>>,
  last_env: Mutex<BTreeMap<String, String>>,
  running: AtomicUsize,
  max_running: AtomicUsize,
}

/// A [`CommandRunner`] whose behavior is keyed by the command string.
///
/// Commands succeed immediately unless configured otherwise. Every call is
/// recorded as `"<step>: <command>"`.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
  inner: Arc<Inner>,
}

impl ScriptedRunner {
  pub fn new() -> Self {
    Self::default()
  }

  fn script(mut self, f: impl FnOnce(&mut Script)) -> Self {
    let inner = Arc::get_mut(&mut self.inner).expect("configure before cloning");
    f(&mut inner.script);
    self
  }

  /// Always exit 1 for `command`.
  pub fn fail_on(self, command: &str) -> Self {
    self.fail_times(command, usize::MAX)
  }

  /// Exit 1 for the first `times` runs of `command`.
  pub fn fail_times(self, command: &str, times: usize) -> Self {
    let command = command.to_string();
    self.script(|s| {
      s.fail.insert(command, times);
    })
  }

  /// Sleep before completing `command`.
  pub fn delay_on(self, command: &str, delay: Duration) -> Self {
    let command = command.to_string();
    self.script(|s| {
      s.delay.insert(command, delay);
    })
  }

  /// Write `content` to `file` (relative to the cwd) when `command` runs.
  pub fn writes(self, command: &str, file: &str, content: &str) -> Self {
    let (command, file, content) = (command.to_string(), file.to_string(), content.to_string());
    self.script(|s| {
      s.writes.entry(command).or_default().push((file, content));
    })
  }

  pub fn commands(&self) -> Vec<String> {
    self.inner.log.lock().unwrap().clone()
  }

  pub fn last_env(&self) -> BTreeMap<String, String> {
    self.inner.last_env.lock().unwrap().clone()
  }

  /// Highest number of commands observed running at once.
  pub fn max_running(&self) -> usize {
    self.inner.max_running.load(Ordering::SeqCst)
  }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
  async fn run(&self, spec: CommandSpec<'_>) -> io::Result<CommandOutput> {
    let inner = &self.inner;
    let failures_before = {
      let mut log = inner.log.lock().unwrap();
      let before = log
        .iter()
        .filter(|line| line.split_once(": ").is_some_and(|(_, c)| c == spec.command))
        .count();
      log.push(format!("{}: {}", spec.step_id, spec.command));
      before
    };
    *inner.last_env.lock().unwrap() = spec.env.clone();

    let now = inner.running.fetch_add(1, Ordering::SeqCst) + 1;
    let _guard = RunningGuard(&inner.running);
    inner.max_running.fetch_max(now, Ordering::SeqCst);

    if let Some(delay) = inner.script.delay.get(spec.command) {
      tokio::time::sleep(*delay).await;
    }

    for (file, content) in inner.script.writes.get(spec.command).into_iter().flatten() {
      let path = spec.cwd.join(file);
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
      }
      std::fs::write(path, content)?;
    }

    let fails = inner
      .script
      .fail
      .get(spec.command)
      .is_some_and(|&times| failures_before < times);

    Ok(CommandOutput {
      code: Some(if fails { 1 } else { 0 }),
      stdout: String::new(),
      stderr: if fails {
        format!("{} failed", spec.command)
      } else {
        String::new()
      },
    })
  }
}

/// A step context over fresh stores and an empty workspace.
pub fn context(runner: ScriptedRunner) -> (TempDir, StepContext) {
  let temp = TempDir::new().unwrap();
  let workspace = temp.path().join("workspace");
  std::fs::create_dir_all(&workspace).unwrap();

  let cache = CacheStore::open(&temp.path().join("store/cache"), 1024 * 1024 * 1024).unwrap();
  let artifacts = ArtifactStore::open(&temp.path().join("store/artifacts")).unwrap();

  let ctx = StepContext {
    runner: Arc::new(runner),
    cache: Arc::new(cache),
    artifacts: Arc::new(artifacts),
    workspace,
    run_id: "run-test".to_string(),
    default_timeout: Duration::from_secs(60),
    cancel: CancellationToken::new(),
  };
  (temp, ctx)
}
