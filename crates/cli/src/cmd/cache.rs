//! Implementation of the `stepwise cache` commands.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use stepwise_lib::coordinator::{Stores, cache_max_bytes_from_env};
use stepwise_lib::platform::paths::store_dir;
use stepwise_lib::store::EvictPolicy;
use stepwise_lib::store_lock::LockMode;

use crate::output::{OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success};

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
  /// Evict cache entries (default: least recently used until under capacity)
  Prune(PruneArgs),

  /// Show cache occupancy
  Stats(StatsArgs),
}

#[derive(Debug, Args)]
pub struct PruneArgs {
  /// Store root for the cache and artifacts
  #[arg(long, value_name = "DIR")]
  pub store: Option<PathBuf>,

  /// Evict least recently used entries until the cache fits in N bytes
  #[arg(long, value_name = "N", conflicts_with_all = ["older_than", "all"])]
  pub max_bytes: Option<u64>,

  /// Evict entries not used within DURATION (e.g. 7days)
  #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration, conflicts_with = "all")]
  pub older_than: Option<Duration>,

  /// Evict every entry
  #[arg(long)]
  pub all: bool,

  /// Output format
  #[arg(short, long, value_enum, default_value_t)]
  pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
  /// Store root for the cache and artifacts
  #[arg(long, value_name = "DIR")]
  pub store: Option<PathBuf>,

  /// Output format
  #[arg(short, long, value_enum, default_value_t)]
  pub output: OutputFormat,
}

pub fn cmd_cache(command: CacheCommand) -> Result<ExitCode> {
  match command {
    CacheCommand::Prune(args) => cmd_prune(args),
    CacheCommand::Stats(args) => cmd_stats(args),
  }
}

fn open_stores(store: Option<PathBuf>, mode: LockMode, command: &str) -> Result<Stores> {
  let root = store.unwrap_or_else(store_dir);
  let max_bytes = cache_max_bytes_from_env()?;
  Stores::open(&root, mode, command, max_bytes).with_context(|| format!("Failed to open store {}", root.display()))
}

fn cmd_prune(args: PruneArgs) -> Result<ExitCode> {
  let start = Instant::now();
  let stores = open_stores(args.store, LockMode::Exclusive, "cache prune")?;

  let policy = if args.all {
    EvictPolicy::All
  } else if let Some(age) = args.older_than {
    EvictPolicy::OlderThan(age)
  } else {
    EvictPolicy::Lru {
      max_bytes: args.max_bytes.unwrap_or_else(|| stores.cache.max_bytes()),
    }
  };

  let report = stores.cache.evict(policy).context("Failed to prune cache")?;

  if args.output.is_json() {
    print_json(&report)?;
  } else {
    if report.entries_removed == 0 {
      print_info("Nothing to prune");
    } else {
      print_success("Cache pruned");
    }
    print_stat("Entries removed", &report.entries_removed.to_string());
    print_stat("Space freed", &format_bytes(report.bytes_freed));
    if report.pinned_skipped > 0 {
      print_stat("Pinned (kept)", &report.pinned_skipped.to_string());
    }
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(ExitCode::SUCCESS)
}

fn cmd_stats(args: StatsArgs) -> Result<ExitCode> {
  let stores = open_stores(args.store, LockMode::Shared, "cache stats")?;
  let stats = stores.cache.stats();

  if args.output.is_json() {
    print_json(&stats)?;
  } else {
    print_info(&format!("Cache: {}", stores.cache.root().display()));
    print_stat("Entries", &stats.entries.to_string());
    print_stat("Size", &format_bytes(stats.total_bytes));
    print_stat("Capacity", &format_bytes(stats.max_bytes));
  }

  Ok(ExitCode::SUCCESS)
}
