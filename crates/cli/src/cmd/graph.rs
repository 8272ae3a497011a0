//! Implementation of the `keel graph` command.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

use keel_lib::action::Target;

use super::load_graph;
use crate::output::{OutputFormat, print_info, print_json};

#[derive(Debug, Serialize)]
struct GraphLayout {
  actions: usize,
  layers: Vec<Vec<Target>>,
}

/// Print the graph's layers: every action appears after all of its
/// dependencies, and actions in one layer are independent of each other.
pub fn cmd_graph(file: &Path, targets: &[String], output: OutputFormat) -> Result<()> {
  let graph = load_graph(file, targets)?;
  let layout = GraphLayout {
    actions: graph.len(),
    layers: graph.topological_layers(),
  };

  if output.is_json() {
    return print_json(&layout);
  }

  print_info(&format!("{} actions in {} layers", layout.actions, layout.layers.len()));
  for (depth, layer) in layout.layers.iter().enumerate() {
    println!();
    println!("Layer {}:", depth);
    for target in layer {
      let deps = graph.dependencies(target);
      if deps.is_empty() {
        println!("  {}", target);
      } else {
        let deps: Vec<String> = deps.iter().map(Target::to_string).collect();
        println!("  {} <- {}", target, deps.join(", "));
      }
    }
  }

  Ok(())
}
