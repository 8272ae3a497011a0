//! Implementation of the `keel traces` command.

use std::path::PathBuf;

use anyhow::{Context, Result};

use keel_lib::platform::paths::traces_dir;
use keel_lib::trace::list_traces;

use crate::output::{OutputFormat, print_info, print_json, symbols};

pub fn cmd_traces(dir: Option<PathBuf>, output: OutputFormat) -> Result<()> {
  let dir = dir.unwrap_or_else(traces_dir);
  let traces = list_traces(&dir).with_context(|| format!("Failed to list traces in {}", dir.display()))?;

  if output.is_json() {
    return print_json(&traces);
  }

  if traces.is_empty() {
    print_info(&format!("No traces in {}", dir.display()));
    return Ok(());
  }

  for trace in &traces {
    let name = trace.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let when = humantime::format_rfc3339_seconds(trace.modified);
    match &trace.command {
      Some(command) => println!("{} {}  {}  {}", symbols::INFO, name, when, command),
      None => println!("{} {}  {}", symbols::INFO, name, when),
    }
  }
  Ok(())
}
