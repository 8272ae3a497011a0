//! Implementation of the `keel cache` commands.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Subcommand;

use keel_lib::cache::DiskCache;
use keel_lib::config::{Settings, parse_size};

use crate::output::{OutputFormat, format_bytes, format_duration, print_json, print_stat, print_success};

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  /// Show entry count and size of the local cache
  Stats {
    /// Local cache directory (default: KEEL_CACHE_DIR or the user cache directory)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Output format
    #[arg(short = 'o', long = "format", value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Evict least recently used entries until the cache fits in a size
  Gc {
    /// Size to shrink to (e.g. 1073741824, 512M, 2G)
    #[arg(long, value_parser = parse_size)]
    max_bytes: u64,

    /// Local cache directory (default: KEEL_CACHE_DIR or the user cache directory)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Output format
    #[arg(short = 'o', long = "format", value_enum, default_value = "text")]
    output: OutputFormat,
  },
}

pub fn cmd_cache(command: CacheCommand) -> Result<()> {
  match command {
    CacheCommand::Stats { cache_dir, output } => cmd_stats(cache_dir, output),
    CacheCommand::Gc {
      max_bytes,
      cache_dir,
      output,
    } => cmd_gc(max_bytes, cache_dir, output),
  }
}

fn open(cache_dir: Option<PathBuf>) -> Result<DiskCache> {
  let settings = Settings::from_env().context("Invalid environment configuration")?;
  let dir = cache_dir.unwrap_or(settings.cache_dir);
  DiskCache::open(&dir, settings.cache_max_bytes).with_context(|| format!("Failed to open cache at {}", dir.display()))
}

fn cmd_stats(cache_dir: Option<PathBuf>, output: OutputFormat) -> Result<()> {
  let cache = open(cache_dir)?;
  let stats = cache.stats();

  if output.is_json() {
    return print_json(&stats);
  }

  println!("Cache: {}", cache.root().display());
  print_stat("Entries", &stats.entries.to_string());
  print_stat("Size", &format_bytes(stats.bytes));
  if let Some(max) = stats.max_bytes {
    print_stat("Limit", &format_bytes(max));
  }
  Ok(())
}

fn cmd_gc(max_bytes: u64, cache_dir: Option<PathBuf>, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let cache = open(cache_dir)?;
  let result = cache.gc(max_bytes);

  if output.is_json() {
    return print_json(&result);
  }

  print_success("Cache garbage collection complete");
  print_stat("Entries removed", &result.entries_removed.to_string());
  print_stat("Space freed", &format_bytes(result.bytes_freed));
  print_stat("Duration", &format_duration(start.elapsed()));
  Ok(())
}
