//! Implementation of the `keel build` command.
//!
//! Loads a graph file, opens the configured cache tiers and runs the
//! scheduler. Ctrl-C cancels the build; running commands get the grace
//! period to stop before they are abandoned.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use keel_lib::cache::TieredCache;
use keel_lib::config::Settings;
use keel_lib::execute::{self, BuildContext};
use keel_lib::platform::paths::traces_dir;
use keel_lib::result::{BuildEvent, EventObserver};
use keel_lib::trace::write_chrome_trace;

use super::load_graph;
use crate::output::{OutputFormat, print_build_summary, print_info, print_json, print_progress};

#[derive(Args, Debug)]
pub struct BuildArgs {
  /// Path to the graph file
  pub file: PathBuf,

  /// Only build these targets and their dependencies (e.g. //app:bin, //lib/...)
  #[arg(short, long = "target")]
  pub targets: Vec<String>,

  /// Maximum number of actions to run at once (default: KEEL_JOBS or CPU count)
  #[arg(short, long)]
  pub jobs: Option<usize>,

  /// Stop starting new actions after the first failure
  #[arg(long)]
  pub fail_fast: bool,

  /// Timeout for each action (e.g. "30s", "5m")
  #[arg(long, value_parser = humantime::parse_duration)]
  pub timeout: Option<Duration>,

  /// How long running actions may take to stop after Ctrl-C
  #[arg(long, value_parser = humantime::parse_duration)]
  pub cancel_grace: Option<Duration>,

  /// Workspace root that inputs resolve against (default: the graph file's directory)
  #[arg(long)]
  pub workspace: Option<PathBuf>,

  /// Where outputs are materialized (default: <workspace>/keel-out)
  #[arg(long)]
  pub out_dir: Option<PathBuf>,

  /// Local cache directory (default: KEEL_CACHE_DIR or the user cache directory)
  #[arg(long)]
  pub cache_dir: Option<PathBuf>,

  /// Base URL of an HTTP remote cache (default: KEEL_REMOTE_CACHE)
  #[arg(long)]
  pub remote: Option<String>,

  /// Run without any cache
  #[arg(long, conflicts_with_all = ["cache_dir", "remote"])]
  pub no_cache: bool,

  /// Write a Chrome trace of the build (default directory: the user data directory)
  #[arg(long, value_name = "DIR")]
  pub trace: Option<Option<PathBuf>>,

  /// Shell for command steps (default: /bin/sh)
  #[arg(long)]
  pub shell: Option<String>,

  /// Output format
  #[arg(short = 'o', long = "format", value_enum, default_value = "text")]
  pub output: OutputFormat,
}

/// Execute the build command. Returns whether every action succeeded.
pub fn cmd_build(args: BuildArgs, verbose: bool) -> Result<bool> {
  let mut settings = Settings::from_env().context("Invalid environment configuration")?;
  if let Some(dir) = &args.cache_dir {
    settings.cache_dir = dir.clone();
  }
  if let Some(url) = &args.remote {
    settings.remote_cache = Some(url.clone());
  }

  let graph = load_graph(&args.file, &args.targets)?;

  let workspace = match &args.workspace {
    Some(dir) => dir.clone(),
    None => args
      .file
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .map(PathBuf::from)
      .unwrap_or_else(|| PathBuf::from(".")),
  };
  let workspace = dunce::canonicalize(&workspace)
    .with_context(|| format!("Workspace {} does not exist", workspace.display()))?;

  let mut config = settings.execute_config();
  if let Some(jobs) = args.jobs {
    config.concurrency = jobs;
  }
  config.fail_fast = args.fail_fast;
  config.action_timeout = args.timeout;
  if let Some(grace) = args.cancel_grace {
    config.cancel_grace = grace;
  }
  config.shell = args.shell.clone();

  let cache = if args.no_cache {
    TieredCache::disabled()
  } else {
    settings
      .open_cache()
      .with_context(|| format!("Failed to open cache at {}", settings.cache_dir.display()))?
  };

  let mut ctx = BuildContext::new(&workspace).with_cache(cache);
  if let Some(out_dir) = &args.out_dir {
    ctx = ctx.with_output_root(out_dir);
  }
  if !args.output.is_json() {
    ctx = ctx.with_observer(progress_printer(verbose));
  }

  info!(
    graph = %args.file.display(),
    workspace = %workspace.display(),
    actions = graph.len(),
    "loaded graph"
  );

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let result = rt
    .block_on(async {
      let cancel = ctx.cancel.clone();
      let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          warn!("interrupt received, cancelling build");
          cancel.cancel();
        }
      });
      let result = execute::run(&graph, &ctx, &config).await;
      interrupt.abort();
      result
    })
    .context("Build aborted")?;

  if let Some(dir) = &args.trace {
    let dir = dir.clone().unwrap_or_else(traces_dir);
    let command = std::env::args().collect::<Vec<_>>().join(" ");
    let path = write_chrome_trace(&result, &dir, Some(&command)).context("Failed to write build trace")?;
    info!(path = %path.display(), "wrote build trace");
    if !args.output.is_json() {
      print_info(&format!("Trace written to {}", path.display()));
    }
  }

  if args.output.is_json() {
    print_json(&result)?;
  } else {
    print_build_summary(&result);
  }

  Ok(result.is_success())
}

fn progress_printer(verbose: bool) -> EventObserver {
  Arc::new(move |event: &BuildEvent| {
    if let BuildEvent::StateChanged(change) = event {
      print_progress(change, verbose);
    }
  })
}
