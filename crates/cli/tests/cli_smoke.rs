//! CLI smoke tests for keel.
//!
//! Every test runs against its own temp workspace and cache directory.

use std::path::Path;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a Command for the keel binary, isolated from the user's cache.
fn keel_cmd(temp: &TempDir) -> Command {
  let mut cmd = cargo_bin_cmd!("keel");
  cmd
    .env("KEEL_CACHE_DIR", temp.path().join("cache"))
    .env("XDG_DATA_HOME", temp.path().join("data"))
    .env_remove("KEEL_REMOTE_CACHE")
    .env_remove("KEEL_JOBS")
    .env_remove("KEEL_CACHE_MAX_BYTES");
  cmd
}

fn write_graph(dir: &Path, json: &str) -> std::path::PathBuf {
  let path = dir.join("graph.json");
  std::fs::write(&path, json).unwrap();
  path
}

/// Two actions, one depending on the other.
const CHAIN_GRAPH: &str = r##"{
  "actions": [
    {
      "target": "//gen:header",
      "outputs": ["version.h"],
      "step": {"type": "write", "content": "#define VERSION 1\n"}
    },
    {
      "target": "//app:app",
      "deps": ["//gen:header"],
      "outputs": ["app.txt"],
      "step": {"type": "write", "content": "app"}
    }
  ]
}"##;

/// A failing action with a dependent, next to an independent one.
const FAILING_GRAPH: &str = r#"{
  "actions": [
    {"target": "//bad:bad", "step": {"type": "cmd", "cmd": "exit 2"}},
    {"target": "//bad:child", "deps": ["//bad:bad"]},
    {"target": "//ok:ok", "outputs": ["ok.txt"], "step": {"type": "write", "content": "ok"}}
  ]
}"#;

const CYCLIC_GRAPH: &str = r#"{
  "actions": [
    {"target": "//a:a", "deps": ["//b:b"]},
    {"target": "//b:b", "deps": ["//a:a"]}
  ]
}"#;

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  let temp = TempDir::new().unwrap();
  keel_cmd(&temp)
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  let temp = TempDir::new().unwrap();
  keel_cmd(&temp)
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("keel"));
}

#[test]
fn subcommand_help_works() {
  let temp = TempDir::new().unwrap();
  for cmd in &["build", "graph", "cache", "traces"] {
    keel_cmd(&temp)
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

// =============================================================================
// Build
// =============================================================================

#[test]
fn build_materializes_outputs() {
  let temp = TempDir::new().unwrap();
  let graph = write_graph(temp.path(), CHAIN_GRAPH);

  keel_cmd(&temp)
    .arg("build")
    .arg(&graph)
    .assert()
    .success()
    .stdout(predicate::str::contains("2 actions: 2 built"));

  let header = temp.path().join("keel-out/gen/__header__/version.h");
  assert_eq!(std::fs::read_to_string(header).unwrap(), "#define VERSION 1\n");
}

#[test]
fn second_build_is_served_from_cache() {
  let temp = TempDir::new().unwrap();
  let graph = write_graph(temp.path(), CHAIN_GRAPH);

  keel_cmd(&temp).arg("build").arg(&graph).assert().success();
  keel_cmd(&temp)
    .arg("build")
    .arg(&graph)
    .assert()
    .success()
    .stdout(predicate::str::contains("2 cached"));
}

#[test]
fn no_cache_always_builds() {
  let temp = TempDir::new().unwrap();
  let graph = write_graph(temp.path(), CHAIN_GRAPH);

  for _ in 0..2 {
    keel_cmd(&temp)
      .args(["build", "--no-cache"])
      .arg(&graph)
      .assert()
      .success()
      .stdout(predicate::str::contains("2 built"));
  }
}

#[cfg(unix)]
#[test]
fn failed_build_exits_nonzero_and_reports_skips() {
  let temp = TempDir::new().unwrap();
  let graph = write_graph(temp.path(), FAILING_GRAPH);

  keel_cmd(&temp)
    .arg("build")
    .arg(&graph)
    .assert()
    .failure()
    .stderr(predicate::str::contains("//bad:bad"))
    .stderr(predicate::str::contains("skipped //bad:child"));

  assert!(temp.path().join("keel-out/ok/__ok__/ok.txt").exists());
}

#[cfg(unix)]
#[test]
fn build_json_output() {
  let temp = TempDir::new().unwrap();
  let graph = write_graph(temp.path(), FAILING_GRAPH);

  let output = keel_cmd(&temp)
    .args(["build", "--format", "json"])
    .arg(&graph)
    .output()
    .unwrap();
  assert!(!output.status.success());

  let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(result["counts"]["failed"], 1);
  assert_eq!(result["counts"]["skipped"], 1);
  assert_eq!(result["outcomes"]["//bad:child"]["state"], "SKIPPED");
}

#[cfg(unix)]
#[test]
fn build_json_output_is_not_mixed_with_command_output() {
  let temp = TempDir::new().unwrap();
  let graph = write_graph(
    temp.path(),
    r#"{"actions": [{"target": "//noisy:noisy", "step": {"type": "cmd", "cmd": "echo noisy-build-log; echo warn >&2"}}]}"#,
  );

  let output = keel_cmd(&temp)
    .args(["build", "--format", "json"])
    .arg(&graph)
    .output()
    .unwrap();
  assert!(output.status.success());

  let stdout = String::from_utf8_lossy(&output.stdout);
  assert!(!stdout.contains("noisy-build-log"));
  let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(result["counts"]["built"], 1);
}

#[test]
fn build_selected_target_only() {
  let temp = TempDir::new().unwrap();
  let graph = write_graph(temp.path(), CHAIN_GRAPH);

  keel_cmd(&temp)
    .args(["build", "--target", "//gen:header"])
    .arg(&graph)
    .assert()
    .success()
    .stdout(predicate::str::contains("1 actions"));
}

#[test]
fn cyclic_graph_is_rejected() {
  let temp = TempDir::new().unwrap();
  let graph = write_graph(temp.path(), CYCLIC_GRAPH);

  keel_cmd(&temp)
    .arg("build")
    .arg(&graph)
    .assert()
    .failure()
    .stderr(predicate::str::contains("dependency cycle"));
}

#[test]
fn missing_graph_file_fails() {
  let temp = TempDir::new().unwrap();
  keel_cmd(&temp)
    .args(["build", "/nonexistent/graph.json"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to read graph file"));
}

// =============================================================================
// Graph, cache and traces
// =============================================================================

#[test]
fn graph_prints_layers() {
  let temp = TempDir::new().unwrap();
  let graph = write_graph(temp.path(), CHAIN_GRAPH);

  keel_cmd(&temp)
    .arg("graph")
    .arg(&graph)
    .assert()
    .success()
    .stdout(predicate::str::contains("Layer 1:"))
    .stdout(predicate::str::contains("//app:app <- //gen:header"));
}

#[test]
fn cache_stats_and_gc() {
  let temp = TempDir::new().unwrap();
  let graph = write_graph(temp.path(), CHAIN_GRAPH);
  keel_cmd(&temp).arg("build").arg(&graph).assert().success();

  let output = keel_cmd(&temp)
    .args(["cache", "stats", "--format", "json"])
    .output()
    .unwrap();
  let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(stats["entries"], 2);

  keel_cmd(&temp)
    .args(["cache", "gc", "--max-bytes", "0"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Entries removed"));

  keel_cmd(&temp)
    .args(["cache", "stats", "--format", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"entries\": 0"));
}

#[test]
fn trace_is_written_and_listed() {
  let temp = TempDir::new().unwrap();
  let graph = write_graph(temp.path(), CHAIN_GRAPH);
  let traces = temp.path().join("traces");

  keel_cmd(&temp)
    .arg("build")
    .arg(&graph)
    .arg("--trace")
    .arg(&traces)
    .assert()
    .success();

  keel_cmd(&temp)
    .arg("traces")
    .arg(&traces)
    .assert()
    .success()
    .stdout(predicate::str::contains("build."))
    .stdout(predicate::str::contains(".trace"));
}

#[test]
fn traces_empty_dir() {
  let temp = TempDir::new().unwrap();
  keel_cmd(&temp)
    .arg("traces")
    .arg(temp.path().join("none"))
    .assert()
    .success()
    .stdout(predicate::str::contains("No traces"));
}
