//! Implementation of the `stepwise plan` command.
//!
//! Validates a project file, expands matrices and prints the execution waves.
//! Nothing runs and the store is not touched.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use owo_colors::{OwoColorize, Stream};

use stepwise_lib::coordinator::plan_project;
use stepwise_lib::plan::{ExecutionPlan, MatrixSelections};

use crate::output::{OutputFormat, print_info, print_json, print_stat, symbols};

#[derive(Debug, Args)]
pub struct PlanArgs {
  /// Path to the project file (YAML or JSON)
  pub file: PathBuf,

  /// Only plan matrix combinations matching axis=value (repeatable)
  #[arg(short, long = "matrix-filter", value_name = "AXIS=VALUE")]
  pub matrix_filter: Vec<String>,

  /// Output format
  #[arg(short, long, value_enum, default_value_t)]
  pub output: OutputFormat,
}

pub fn cmd_plan(args: PlanArgs) -> Result<ExitCode> {
  let selections = MatrixSelections::parse(&args.matrix_filter)?;
  let plan =
    plan_project(&args.file, &selections).with_context(|| format!("Failed to plan {}", args.file.display()))?;

  if args.output.is_json() {
    print_json(&plan)?;
  } else {
    print_plan(&plan);
  }

  Ok(ExitCode::SUCCESS)
}

fn print_plan(plan: &ExecutionPlan) {
  print_info(&format!("Plan: {}", plan.project_hash));

  for (index, wave) in plan.waves.iter().enumerate() {
    println!("Wave {}:", index + 1);
    for id in wave {
      let deps = plan
        .step(id)
        .map(|step| step.depends_on.iter().map(String::as_str).collect::<Vec<_>>().join(", "))
        .unwrap_or_default();
      if deps.is_empty() {
        println!("  {} {}", symbols::INFO, id);
      } else {
        println!(
          "  {} {} {}",
          symbols::INFO,
          id,
          format!("{} {}", symbols::ARROW, deps).if_supports_color(Stream::Stdout, |s| s.dimmed())
        );
      }
    }
  }

  println!();
  print_stat("Steps", &plan.len().to_string());
  print_stat("Waves", &plan.waves.len().to_string());
  if let Some(timeout) = plan.timeout {
    print_stat("Timeout", &humantime::format_duration(timeout).to_string());
  }
}
