mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{BuildArgs, CacheCommand, cmd_build, cmd_cache, cmd_graph, cmd_traces};
use output::OutputFormat;

/// keel - parallel build-graph runner with content-addressed caching
#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Increase log verbosity (-v for info, -vv for debug)
  #[arg(short, long, global = true, action = ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build the actions of a graph file
  Build(BuildArgs),

  /// Show the execution layers of a graph file
  Graph {
    /// Path to the graph file
    file: PathBuf,

    /// Restrict to these targets and their dependencies (e.g. //app:bin, //lib/...)
    #[arg(short, long = "target")]
    targets: Vec<String>,

    /// Output format
    #[arg(short = 'o', long = "format", value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Inspect or shrink the local cache
  Cache {
    #[command(subcommand)]
    command: CacheCommand,
  },

  /// List recorded build traces, newest first
  Traces {
    /// Trace directory (default: the user data directory)
    dir: Option<PathBuf>,

    /// Output format
    #[arg(short = 'o', long = "format", value_enum, default_value = "text")]
    output: OutputFormat,
  },
}

fn main() -> Result<ExitCode> {
  let cli = Cli::parse();

  let default_level = match cli.verbose {
    0 => "warn",
    1 => "info",
    _ => "debug",
  };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Build(args) => {
      let success = cmd_build(args, cli.verbose > 0)?;
      return Ok(if success { ExitCode::SUCCESS } else { ExitCode::FAILURE });
    }
    Commands::Graph { file, targets, output } => cmd_graph(&file, &targets, output)?,
    Commands::Cache { command } => cmd_cache(command)?,
    Commands::Traces { dir, output } => cmd_traces(dir, output)?,
  }

  Ok(ExitCode::SUCCESS)
}
