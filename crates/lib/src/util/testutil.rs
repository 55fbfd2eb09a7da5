//! Test utilities for stepwise-lib.
//!
//! Cross-platform command strings for tests that run real shell commands
//! through the default runner.

/// A command that prints the value of an environment variable.
#[cfg(unix)]
pub fn echo_env(var: &str) -> String {
  format!("echo \"${}\"", var)
}

#[cfg(windows)]
pub fn echo_env(var: &str) -> String {
  format!("Write-Output $env:{}", var)
}

/// A command that writes `content` to `file` (relative to the working dir).
#[cfg(unix)]
pub fn write_file(file: &str, content: &str) -> String {
  format!("mkdir -p \"$(dirname '{file}')\" && printf '%s' '{content}' > '{file}'")
}

#[cfg(windows)]
pub fn write_file(file: &str, content: &str) -> String {
  format!(
    "New-Item -ItemType Directory -Force -Path (Split-Path -Parent '{file}') | Out-Null; Set-Content -NoNewline -Path '{file}' -Value '{content}'"
  )
}

/// A command that exits with the given status.
pub fn exit_with(code: i32) -> String {
  format!("exit {}", code)
}

/// A command that sleeps for the given number of seconds.
#[cfg(unix)]
pub fn sleep_secs(secs: u64) -> String {
  format!("sleep {}", secs)
}

#[cfg(windows)]
pub fn sleep_secs(secs: u64) -> String {
  format!("Start-Sleep -Seconds {}", secs)
}
