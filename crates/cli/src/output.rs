//! Terminal output: colored progress and summary lines, byte and duration
//! formatting, and JSON for `--format json`.
//!
//! Status lines for a build go to stdout; failures and skips go to stderr so
//! they stay visible when stdout is piped.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

use keel_lib::execute::ExecutionState;
use keel_lib::result::{BuildResult, StateChange};
use keel_lib::rulekey::Fingerprint;

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
  pub const CACHED: &str = "↺";
  pub const ERROR: &str = "✗";
  pub const SKIPPED: &str = "⚠";
  pub const INFO: &str = "•";
}

/// First 12 hex characters of a fingerprint.
pub fn short_fingerprint(fp: &Fingerprint) -> String {
  fp.to_hex()[..12].to_string()
}

pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
  let mut value = bytes as f64;
  let mut unit = 0;
  while value >= 1024.0 && unit < UNITS.len() - 1 {
    value /= 1024.0;
    unit += 1;
  }
  if unit == 0 {
    format!("{} B", bytes)
  } else {
    format!("{:.1} {}", value, UNITS[unit])
  }
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  if secs >= 60 {
    format!("{}m {}s", secs / 60, secs % 60)
  } else if secs > 0 {
    format!("{:.2}s", duration.as_secs_f64())
  } else {
    format!("{}ms", duration.as_millis())
  }
}

/// One line per finished action. Failures and skips wait for the summary.
pub fn print_progress(change: &StateChange, verbose: bool) {
  let (symbol, suffix) = match change.state {
    ExecutionState::Built => (symbols::SUCCESS, ""),
    ExecutionState::CacheHit => (symbols::CACHED, " (cached)"),
    _ => return,
  };
  let fingerprint = match (&change.fingerprint, verbose) {
    (Some(fp), true) => format!(" {}", short_fingerprint(fp)),
    _ => String::new(),
  };
  println!(
    "{} {}{}{}",
    symbol.if_supports_color(Stream::Stdout, |s| s.green()),
    change.target,
    suffix.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    fingerprint.if_supports_color(Stream::Stdout, |s| s.dimmed())
  );
}

/// Failures with their causes, skips with the upstream failure, then counts.
pub fn print_build_summary(result: &BuildResult) {
  println!();
  for failure in &result.failures {
    print_error(&format!("{}: {}", failure.target, failure.cause));
  }
  for (target, reason) in result.skipped() {
    eprintln!(
      "{} skipped {}: {}",
      symbols::SKIPPED.if_supports_color(Stream::Stderr, |s| s.yellow()),
      target,
      reason
    );
  }

  let c = &result.counts;
  let counts = format!(
    "{} actions: {} built, {} cached, {} failed, {} skipped in {}",
    c.total,
    c.built,
    c.cache_hit,
    c.failed,
    c.skipped,
    format_duration(result.wall_time())
  );
  if result.is_success() {
    print_success(&counts);
  } else {
    print_error(&counts);
  }
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()), value);
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
  println!("{}", json);
  Ok(())
}
