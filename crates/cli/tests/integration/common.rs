//! Shared test helpers for CLI integration tests.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Get path to a fixture file.
pub fn fixture_path(name: &str) -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR"))
    .join("tests")
    .join("fixtures")
    .join(name)
}

/// Read fixture content.
pub fn fixture_content(name: &str) -> String {
  std::fs::read_to_string(fixture_path(name)).unwrap_or_else(|e| panic!("Failed to load fixture {}: {}", name, e))
}

/// Isolated test environment.
///
/// Each test gets its own workspace holding the project file, and its own
/// store root.
pub struct TestEnv {
  pub temp: TempDir,
  pub project_path: PathBuf,
}

impl TestEnv {
  /// Create from a fixture file, keeping its extension.
  pub fn from_fixture(name: &str) -> Self {
    let temp = TempDir::new().unwrap();
    let ext = Path::new(name).extension().and_then(|e| e.to_str()).unwrap_or("yaml");
    let workspace = temp.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();
    let project_path = workspace.join(format!("stepwise.{}", ext));
    std::fs::write(&project_path, fixture_content(name)).unwrap();
    Self { temp, project_path }
  }

  /// Create an environment with an inline project file.
  pub fn with_project(content: &str) -> Self {
    let temp = TempDir::new().unwrap();
    let workspace = temp.path().join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();
    let project_path = workspace.join("stepwise.yaml");
    std::fs::write(&project_path, content).unwrap();
    Self { temp, project_path }
  }

  pub fn workspace(&self) -> PathBuf {
    self.temp.path().join("workspace")
  }

  /// Write a file relative to the workspace.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.workspace().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  /// Store root (isolated per test, not created up front).
  pub fn store_path(&self) -> PathBuf {
    self.temp.path().join("store")
  }

  /// Get a pre-configured Command for the stepwise binary.
  ///
  /// Sets environment variables for isolated testing:
  /// - `STEPWISE_STORE`: Isolated store root
  /// - `XDG_CACHE_HOME` / `LOCALAPPDATA`: Isolated platform cache dir
  pub fn cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("stepwise");
    cmd.current_dir(self.temp.path());
    cmd.env("STEPWISE_STORE", self.store_path());
    cmd.env("XDG_CACHE_HOME", self.temp.path().join("cache"));
    cmd.env("LOCALAPPDATA", self.temp.path().join("cache")); // For Windows
    cmd.env_remove("STEPWISE_CACHE_MAX_BYTES");
    cmd.env_remove("RUST_LOG");
    cmd
  }

  /// `stepwise run <project>` with `-o json`, parsed.
  pub fn run_json(&self, extra: &[&str]) -> (Option<i32>, serde_json::Value) {
    let output = self
      .cmd()
      .arg("run")
      .arg(&self.project_path)
      .args(["-o", "json"])
      .args(extra)
      .output()
      .unwrap();
    let report = serde_json::from_slice(&output.stdout)
      .unwrap_or_else(|e| panic!("invalid JSON report ({}): {}", e, String::from_utf8_lossy(&output.stdout)));
    (output.status.code(), report)
  }
}

/// Find a step entry in a JSON batch report.
pub fn step<'a>(report: &'a serde_json::Value, id: &str) -> &'a serde_json::Value {
  report["steps"]
    .as_array()
    .unwrap()
    .iter()
    .find(|s| s["id"] == id)
    .unwrap_or_else(|| panic!("step {} missing from report", id))
}
