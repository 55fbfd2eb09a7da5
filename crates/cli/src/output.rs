//! Terminal output: status lines, sizes, durations and `-o json`.
//!
//! Colors are only emitted when the target stream supports them, so piped
//! output and test captures stay plain.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{AnsiColors, OwoColorize, Stream};

use stepwise_lib::execute::StepStatus;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const SKIP: &str = "-";
}

/// First 12 characters of a digest.
pub fn truncate_hash(hash: &str) -> &str {
  &hash[..hash.len().min(12)]
}

pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

  if bytes < 1024 {
    return format!("{} B", bytes);
  }
  let mut value = bytes as f64 / 1024.0;
  let mut unit = 0;
  while value >= 1024.0 && unit < UNITS.len() - 1 {
    value /= 1024.0;
    unit += 1;
  }
  format!("{:.1} {}", value, UNITS[unit])
}

/// `850ms`, `4.20s`, `3m 7s`.
pub fn format_duration(duration: Duration) -> String {
  match duration.as_secs() {
    0 => format!("{}ms", duration.as_millis()),
    secs @ 1..60 => format!("{}.{:02}s", secs, duration.subsec_millis() / 10),
    secs => format!("{}m {}s", secs / 60, secs % 60),
  }
}

fn colored(text: &str, stream: Stream, color: AnsiColors) -> String {
  text.if_supports_color(stream, |t| t.color(color)).to_string()
}

/// Colored symbol for a step status.
pub fn status_symbol(status: StepStatus) -> String {
  let (symbol, color) = match status {
    StepStatus::Succeeded => (symbols::SUCCESS, AnsiColors::Green),
    StepStatus::Failed | StepStatus::TimedOut => (symbols::ERROR, AnsiColors::Red),
    StepStatus::Cancelled => (symbols::WARNING, AnsiColors::Yellow),
    StepStatus::Skipped => (symbols::SKIP, AnsiColors::BrightBlack),
  };
  colored(symbol, Stream::Stdout, color)
}

pub fn print_success(message: &str) {
  println!("{} {}", colored(symbols::SUCCESS, Stream::Stdout, AnsiColors::Green), message);
}

pub fn print_info(message: &str) {
  println!("{} {}", colored(symbols::INFO, Stream::Stdout, AnsiColors::Blue), message);
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    colored(symbols::ERROR, Stream::Stderr, AnsiColors::Red),
    colored(message, Stream::Stderr, AnsiColors::Red)
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    colored(symbols::WARNING, Stream::Stderr, AnsiColors::Yellow),
    colored(message, Stream::Stderr, AnsiColors::Yellow)
  );
}

/// An indented `label: value` line.
pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {}", label.if_supports_color(Stream::Stdout, |l| l.dimmed()), value);
}

/// Print `text` indented and dimmed, one line at a time.
pub fn print_detail(text: &str) {
  for line in text.lines() {
    println!("      {}", line.if_supports_color(Stream::Stdout, |l| l.dimmed()));
  }
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}
