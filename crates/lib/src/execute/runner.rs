//! Command unit execution.
//!
//! The executor hands each opaque command unit to a [`CommandRunner`]. The
//! default [`ShellRunner`] runs it through the platform shell with an
//! isolated environment.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

/// One command unit to run.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec<'a> {
  pub step_id: &'a str,
  pub command: &'a str,
  pub env: &'a BTreeMap<String, String>,
  pub cwd: &'a Path,
}

/// Exit status and captured output of a command unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
  /// Exit code; `None` when killed by a signal.
  pub code: Option<i32>,
  pub stdout: String,
  pub stderr: String,
}

impl CommandOutput {
  pub fn success(&self) -> bool {
    self.code == Some(0)
  }

  /// The last `lines` lines of stderr, or of stdout when stderr is empty.
  pub fn tail(&self, lines: usize) -> String {
    let source = if self.stderr.trim().is_empty() {
      &self.stdout
    } else {
      &self.stderr
    };
    let all: Vec<&str> = source.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
  }
}

/// Runs command units.
///
/// Dropping the returned future must stop the command; the executor relies
/// on that for timeouts and cancellation.
#[async_trait]
pub trait CommandRunner: Send + Sync {
  async fn run(&self, spec: CommandSpec<'_>) -> io::Result<CommandOutput>;
}

/// Host variables passed through to command units.
#[cfg(unix)]
const PASSTHROUGH_VARS: &[&str] = &["PATH", "HOME", "USER", "TMPDIR"];

#[cfg(windows)]
const PASSTHROUGH_VARS: &[&str] = &[
  "PATH",
  "PATHEXT",
  "SYSTEMROOT",
  "SYSTEMDRIVE",
  "COMSPEC",
  "USERPROFILE",
  "LOCALAPPDATA",
  "APPDATA",
  "TEMP",
  "TMP",
];

/// Runs command units through `/bin/sh -c` (Unix) or PowerShell (Windows).
///
/// The environment is cleared; only a few host variables (`PATH`, `HOME`,
/// temp dirs) pass through, then the step env is applied on top.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
  shell: Option<String>,
}

impl ShellRunner {
  pub fn new(shell: Option<String>) -> Self {
    Self { shell }
  }
}

#[async_trait]
impl CommandRunner for ShellRunner {
  async fn run(&self, spec: CommandSpec<'_>) -> io::Result<CommandOutput> {
    let (shell_cmd, shell_args) = get_shell(self.shell.as_deref());

    let mut command = Command::new(&shell_cmd);
    command
      .args(&shell_args)
      .arg(spec.command)
      .current_dir(spec.cwd)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true)
      .env_clear();

    #[cfg(unix)]
    command.process_group(0);

    for var in PASSTHROUGH_VARS {
      if let Some(value) = std::env::var_os(var) {
        command.env(var, value);
      }
    }

    command
      .env("LANG", "C")
      .env("LC_ALL", "C")
      // 315532800 = January 1, 1980 00:00:00 UTC (ZIP epoch)
      .env("SOURCE_DATE_EPOCH", "315532800")
      .envs(spec.env);

    debug!(step = %spec.step_id, shell = %shell_cmd, cwd = %spec.cwd.display(), "spawning process");

    let child = command.spawn()?;
    let _tree = ProcessTree::attach(&child)?;
    let output = child.wait_with_output().await?;
    let result = CommandOutput {
      code: output.status.code(),
      stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
      stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    if !result.stdout.is_empty() {
      debug!(step = %spec.step_id, stdout = %result.stdout.trim_end(), "command stdout");
    }
    if !result.stderr.is_empty() {
      debug!(step = %spec.step_id, stderr = %result.stderr.trim_end(), "command stderr");
    }

    Ok(result)
  }
}

/// Every process a command unit started. Dropping it kills whatever is still
/// running, so subshells and background jobs die with the unit.
#[cfg(unix)]
struct ProcessTree(Option<rustix::process::Pid>);

#[cfg(unix)]
impl ProcessTree {
  /// The child leads its own process group (`process_group(0)`).
  fn attach(child: &tokio::process::Child) -> io::Result<Self> {
    let leader = child
      .id()
      .and_then(|id| i32::try_from(id).ok())
      .and_then(rustix::process::Pid::from_raw);
    Ok(Self(leader))
  }
}

#[cfg(unix)]
impl Drop for ProcessTree {
  fn drop(&mut self) {
    if let Some(group) = self.0 {
      // ESRCH once every member has exited
      let _ = rustix::process::kill_process_group(group, rustix::process::Signal::KILL);
    }
  }
}

/// A job object that kills its processes when the handle closes.
#[cfg(windows)]
struct ProcessTree(windows_sys::Win32::Foundation::HANDLE);

// SAFETY: a job handle is valid from any thread of the process.
#[cfg(windows)]
unsafe impl Send for ProcessTree {}

#[cfg(windows)]
impl ProcessTree {
  fn attach(child: &tokio::process::Child) -> io::Result<Self> {
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::System::JobObjects::{
      AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
      JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JobObjectExtendedLimitInformation, SetInformationJobObject,
    };

    let Some(process) = child.raw_handle() else {
      return Ok(Self(std::ptr::null_mut()));
    };

    // SAFETY: `process` is owned by `child`, which outlives this call. The
    // job handle is closed by `Drop`, including on the error paths below.
    unsafe {
      let job = CreateJobObjectW(std::ptr::null(), std::ptr::null());
      if job.is_null() {
        return Err(io::Error::last_os_error());
      }
      let tree = Self(job);

      let mut limits: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = std::mem::zeroed();
      limits.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
      let configured = SetInformationJobObject(
        job,
        JobObjectExtendedLimitInformation,
        &limits as *const _ as *const std::ffi::c_void,
        std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
      );
      if configured == 0 || AssignProcessToJobObject(job, process as HANDLE) == 0 {
        return Err(io::Error::last_os_error());
      }
      Ok(tree)
    }
  }
}

#[cfg(windows)]
impl Drop for ProcessTree {
  fn drop(&mut self) {
    if !self.0.is_null() {
      // SAFETY: the handle came from CreateJobObjectW and is closed once.
      unsafe {
        windows_sys::Win32::Foundation::CloseHandle(self.0);
      }
    }
  }
}

/// Get the shell command and arguments for the current platform.
///
/// The default is `/bin/sh` (Unix) or `powershell.exe` (Windows), never the
/// user's `$SHELL`, so profile files cannot leak into the environment.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ]
    } else if shell.ends_with("cmd") || shell.ends_with("cmd.exe") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    (
      "powershell.exe".to_string(),
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ],
    )
  }
}
