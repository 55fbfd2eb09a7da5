mod cmd;
mod output;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{CacheCommand, PlanArgs, RunArgs};
use output::print_error;

/// Exit code for definition and infrastructure errors.
const EXIT_ERROR: u8 = 2;

/// stepwise - Run multi-step build pipelines with caching and artifacts
#[derive(Parser)]
#[command(name = "stepwise")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, global = true, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a project file
  Run(RunArgs),

  /// Show the execution waves of a project file without running it
  Plan(PlanArgs),

  /// Inspect or prune the build cache
  #[command(subcommand)]
  Cache(CacheCommand),
}

fn init_tracing(verbose: u8) {
  let filter = match verbose {
    0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    1 => EnvFilter::new("info"),
    _ => EnvFilter::new("debug"),
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let result = match cli.command {
    Commands::Run(args) => cmd::cmd_run(args),
    Commands::Plan(args) => cmd::cmd_plan(args),
    Commands::Cache(command) => cmd::cmd_cache(command),
  };

  match result {
    Ok(code) => code,
    Err(err) => {
      print_error(&format!("{:#}", err));
      ExitCode::from(EXIT_ERROR)
    }
  }
}
