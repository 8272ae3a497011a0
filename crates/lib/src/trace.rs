//! Build traces in the Chrome trace-event format.
//!
//! One complete (`"ph": "X"`) event per action that ran, placed on lanes so
//! that overlapping actions never share a `tid`. Files are named
//! `build.<build_id>.trace` and can be loaded into `chrome://tracing` or
//! Perfetto.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::action::Target;
use crate::consts::{TRACE_FILE_PREFIX, TRACE_FILE_SUFFIX};
use crate::result::BuildResult;
use crate::rulekey::Fingerprint;

#[derive(Debug, Error)]
pub enum TraceError {
  #[error("trace io error on {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to encode trace: {0}")]
  Encode(#[from] serde_json::Error),
}

impl TraceError {
  fn io(path: &Path, source: io::Error) -> Self {
    TraceError::Io {
      path: path.display().to_string(),
      source,
    }
  }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraceFile {
  trace_events: Vec<TraceEvent>,
  #[serde(default)]
  other_data: TraceAttributes,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct TraceAttributes {
  #[serde(default)]
  build_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TraceEvent {
  name: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  cat: String,
  ph: String,
  #[serde(default)]
  ts: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  dur: Option<u64>,
  pid: u32,
  tid: u32,
  #[serde(default)]
  args: EventArgs,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EventArgs {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  state: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  fingerprint: Option<Fingerprint>,
}

/// A trace file found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceInfo {
  /// Build id taken from the file name.
  pub id: String,
  pub path: PathBuf,
  #[serde(with = "unix_ms")]
  pub modified: SystemTime,
  /// Command line that produced the build, when recorded.
  pub command: Option<String>,
}

mod unix_ms {
  use serde::Serializer;
  use std::time::{SystemTime, UNIX_EPOCH};

  pub fn serialize<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    let ms = time.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0);
    serializer.serialize_u64(ms)
  }
}

/// File name of the trace for `build_id`.
pub fn trace_file_name(build_id: &str) -> String {
  format!("{}{}{}", TRACE_FILE_PREFIX, build_id, TRACE_FILE_SUFFIX)
}

/// Write the trace of `result` into `dir` and return its path.
pub fn write_chrome_trace(result: &BuildResult, dir: &Path, command: Option<&str>) -> Result<PathBuf, TraceError> {
  fs::create_dir_all(dir).map_err(|e| TraceError::io(dir, e))?;

  let trace = TraceFile {
    trace_events: trace_events(result),
    other_data: TraceAttributes {
      build_id: result.build_id.clone(),
      command: command.map(str::to_string),
    },
  };
  let bytes = serde_json::to_vec(&trace)?;

  let path = dir.join(trace_file_name(&result.build_id));
  let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| TraceError::io(dir, e))?;
  tmp.write_all(&bytes).map_err(|e| TraceError::io(tmp.path(), e))?;
  tmp.persist(&path).map_err(|e| TraceError::io(&path, e.error))?;

  debug!(path = %path.display(), events = trace.trace_events.len(), "wrote build trace");
  Ok(path)
}

fn trace_events(result: &BuildResult) -> Vec<TraceEvent> {
  let pid = std::process::id();
  let mut events = vec![TraceEvent {
    name: "process_name".to_string(),
    cat: String::new(),
    ph: "M".to_string(),
    ts: 0,
    dur: None,
    pid,
    tid: 0,
    args: EventArgs {
      name: Some(format!("keel build {}", result.build_id)),
      ..EventArgs::default()
    },
  }];

  let mut timed: Vec<(&Target, u64, u64)> = result
    .outcomes
    .iter()
    .filter_map(|(target, outcome)| outcome.timing.map(|t| (target, t.start_us, t.duration_us)))
    .collect();
  timed.sort_by_key(|(target, start, _)| (*start, (*target).clone()));

  // End time of the last event on each lane
  let mut lanes: Vec<u64> = Vec::new();
  for (target, start, dur) in timed {
    let tid = match lanes.iter().position(|end| *end <= start) {
      Some(lane) => lane,
      None => {
        lanes.push(0);
        lanes.len() - 1
      }
    };
    lanes[tid] = start + dur;

    let outcome = &result.outcomes[target];
    events.push(TraceEvent {
      name: target.to_string(),
      cat: "action".to_string(),
      ph: "X".to_string(),
      ts: start,
      dur: Some(dur),
      pid,
      tid: tid as u32 + 1,
      args: EventArgs {
        name: None,
        state: Some(outcome.state.to_string()),
        fingerprint: outcome.fingerprint,
      },
    });
  }

  events
}

/// List trace files in `dir`, newest first. A missing directory has no traces.
pub fn list_traces(dir: &Path) -> Result<Vec<TraceInfo>, TraceError> {
  let entries = match fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(TraceError::io(dir, e)),
  };

  let mut traces = Vec::new();
  for entry in entries {
    let entry = entry.map_err(|e| TraceError::io(dir, e))?;
    let file_name = entry.file_name();
    let Some(id) = file_name
      .to_str()
      .and_then(|name| name.strip_prefix(TRACE_FILE_PREFIX))
      .and_then(|name| name.strip_suffix(TRACE_FILE_SUFFIX))
    else {
      continue;
    };

    let path = entry.path();
    let modified = entry
      .metadata()
      .and_then(|m| m.modified())
      .map_err(|e| TraceError::io(&path, e))?;

    traces.push(TraceInfo {
      id: id.to_string(),
      command: read_attributes(&path).and_then(|a| a.command),
      path,
      modified,
    });
  }

  traces.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.id.cmp(&b.id)));
  Ok(traces)
}

/// Attributes recorded in a trace file. Unreadable traces have none.
fn read_attributes(path: &Path) -> Option<TraceAttributes> {
  let bytes = fs::read(path).ok()?;
  match serde_json::from_slice::<TraceFile>(&bytes) {
    Ok(trace) => Some(trace.other_data),
    Err(e) => {
      debug!(path = %path.display(), error = %e, "ignoring unreadable trace");
      None
    }
  }
}
