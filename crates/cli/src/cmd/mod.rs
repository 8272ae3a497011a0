mod build;
mod cache;
mod graph;
mod traces;

pub use build::{BuildArgs, cmd_build};
pub use cache::{CacheCommand, cmd_cache};
pub use graph::cmd_graph;
pub use traces::cmd_traces;

use std::path::Path;

use anyhow::{Context, Result};

use keel_lib::graph::ActionGraph;

/// Load a graph file, optionally narrowed to `targets` and their dependencies.
pub(crate) fn load_graph(file: &Path, targets: &[String]) -> Result<ActionGraph> {
  let json = std::fs::read_to_string(file).with_context(|| format!("Failed to read graph file {}", file.display()))?;
  let graph = ActionGraph::from_json(&json).with_context(|| format!("Invalid graph file {}", file.display()))?;
  if targets.is_empty() {
    return Ok(graph);
  }
  graph.select(targets).context("Failed to select targets")
}
