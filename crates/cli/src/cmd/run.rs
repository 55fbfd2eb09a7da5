//! Implementation of the `stepwise run` command.
//!
//! Loads a project file, runs it to completion and prints the batch report.
//! Ctrl-C cancels the run: running steps are stopped and the rest skipped.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use stepwise_lib::coordinator::{RunOptions, run_project};
use stepwise_lib::execute::{BatchReport, BatchStatus, StepResult, StepStatus};
use stepwise_lib::plan::MatrixSelections;

use crate::output::{
  OutputFormat, format_duration, print_detail, print_error, print_json, print_stat, print_success, print_warning,
  status_symbol, truncate_hash,
};

#[derive(Debug, Args)]
pub struct RunArgs {
  /// Path to the project file (YAML or JSON)
  pub file: PathBuf,

  /// Maximum number of steps running at once (default: number of CPUs)
  #[arg(short = 'j', long, value_parser = clap::value_parser!(u64).range(1..))]
  pub max_concurrency: Option<u64>,

  /// Stop dispatching new steps after the first failure
  #[arg(long)]
  pub fail_fast: bool,

  /// Only run matrix combinations matching axis=value (repeatable)
  #[arg(short, long = "matrix-filter", value_name = "AXIS=VALUE")]
  pub matrix_filter: Vec<String>,

  /// Store root for the cache and artifacts
  #[arg(long, value_name = "DIR")]
  pub store: Option<PathBuf>,

  /// Timeout for steps that don't declare one (e.g. 30m)
  #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
  pub step_timeout: Option<Duration>,

  /// Shell used to run commands (default: /bin/sh or powershell)
  #[arg(long)]
  pub shell: Option<String>,

  /// Output format
  #[arg(short, long, value_enum, default_value_t)]
  pub output: OutputFormat,
}

impl RunArgs {
  fn options(&self) -> Result<RunOptions> {
    let mut options = RunOptions {
      fail_fast: self.fail_fast,
      matrix: MatrixSelections::parse(&self.matrix_filter)?,
      store_dir: self.store.clone(),
      shell: self.shell.clone(),
      ..RunOptions::default()
    };
    if let Some(n) = self.max_concurrency {
      options.max_concurrency = usize::try_from(n).context("--max-concurrency is too large")?;
    }
    if let Some(timeout) = self.step_timeout {
      options.default_step_timeout = timeout;
    }
    Ok(options)
  }
}

/// Execute the run command.
///
/// Returns exit code 0 when every step succeeded and 1 otherwise. Definition
/// and store errors are returned as `Err`.
pub fn cmd_run(args: RunArgs) -> Result<ExitCode> {
  let options = args.options()?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt
    .block_on(async {
      let cancel = CancellationToken::new();
      let on_interrupt = cancel.clone();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          warn!("interrupt received, cancelling run");
          on_interrupt.cancel();
        }
      });
      run_project(&args.file, &options, cancel).await
    })
    .with_context(|| format!("Failed to run {}", args.file.display()))?;

  if args.output.is_json() {
    print_json(&report)?;
  } else {
    print_report(&report);
  }

  Ok(if report.is_success() {
    ExitCode::SUCCESS
  } else {
    ExitCode::FAILURE
  })
}

fn print_report(report: &BatchReport) {
  for (index, wave) in report.waves.iter().enumerate() {
    println!("Wave {}:", index + 1);
    for id in wave {
      if let Some(step) = report.get(id) {
        print_step(step);
      }
    }
  }

  println!();
  match report.status {
    BatchStatus::Succeeded => print_success(&format!("Run {} succeeded", report.run_id)),
    BatchStatus::Failed => print_error(&format!("Run {} failed", report.run_id)),
    BatchStatus::Cancelled => print_warning(&format!("Run {} cancelled", report.run_id)),
  }
  print_stat("Steps", &report.total().to_string());
  print_stat("Succeeded", &report.count(StepStatus::Succeeded).to_string());
  let failed = report.count(StepStatus::Failed) + report.count(StepStatus::TimedOut);
  if failed > 0 {
    print_stat("Failed", &failed.to_string());
  }
  for status in [StepStatus::Skipped, StepStatus::Cancelled] {
    let count = report.count(status);
    if count > 0 {
      print_stat(capitalize(status.as_str()).as_str(), &count.to_string());
    }
  }
  print_stat("Cache hits", &report.cache_hits().to_string());
  print_stat("Duration", &format_duration(report.duration));
}

fn print_step(step: &StepResult) {
  let mut line = format!("  {} {}", status_symbol(step.status), step.id);

  if step.cache_hit {
    let key = step.cache_key.as_ref().map(|k| truncate_hash(&k.0)).unwrap_or_default();
    line.push_str(&format!(" (cached {})", key));
  } else if step.status != StepStatus::Skipped {
    line.push_str(&format!(" ({})", format_duration(step.duration)));
  }
  if step.attempts > 1 {
    line.push_str(&format!(" [{} attempts]", step.attempts));
  }

  let mut detail = None;
  if let Some(reason) = &step.reason {
    let (first, rest) = reason.split_once('\n').unwrap_or((reason, ""));
    line.push_str(&format!(": {}", first));
    if !rest.is_empty() {
      detail = Some(rest);
    }
  }

  println!("{}", line);
  if let Some(detail) = detail {
    print_detail(detail);
  }
  for artifact in &step.artifacts {
    print_detail(&format!("artifact {} {}", artifact.name, artifact.path.display()));
  }
}

fn capitalize(s: &str) -> String {
  let mut chars = s.chars();
  match chars.next() {
    Some(first) => first.to_uppercase().chain(chars).collect(),
    None => String::new(),
  }
}
