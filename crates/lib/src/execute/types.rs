//! Types for scheduling and executing an action graph.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::action::Target;
use crate::cache::CacheError;
use crate::graph::GraphError;

/// Per-action scheduling state. Only the scheduler changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
  Pending,
  Ready,
  Running,
  CacheHit,
  Built,
  Failed,
  Skipped,
}

impl ExecutionState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      ExecutionState::CacheHit | ExecutionState::Built | ExecutionState::Failed | ExecutionState::Skipped
    )
  }

  /// Whether dependents may run after this state.
  pub fn is_success(self) -> bool {
    matches!(self, ExecutionState::CacheHit | ExecutionState::Built)
  }
}

impl fmt::Display for ExecutionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ExecutionState::Pending => "PENDING",
      ExecutionState::Ready => "READY",
      ExecutionState::Running => "RUNNING",
      ExecutionState::CacheHit => "CACHE_HIT",
      ExecutionState::Built => "BUILT",
      ExecutionState::Failed => "FAILED",
      ExecutionState::Skipped => "SKIPPED",
    };
    f.write_str(s)
  }
}

/// Why an action failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
  /// The transformation (or computing its rule key) failed.
  ActionExecution { message: String },
  Timeout { limit_ms: u64 },
  Cancelled,
}

impl fmt::Display for FailureCause {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FailureCause::ActionExecution { message } => f.write_str(message),
      FailureCause::Timeout { limit_ms } => write!(f, "timed out after {}ms", limit_ms),
      FailureCause::Cancelled => f.write_str("cancelled"),
    }
  }
}

/// Why an action was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum SkipReason {
  /// A dependency (direct or transitive) failed; holds the failed target.
  UpstreamFailed(Target),
  /// Fail-fast stopped dispatch; holds the first failed target.
  FailFast(Target),
  /// The build was cancelled before the action was dispatched.
  Cancelled,
}

impl SkipReason {
  /// The failed target responsible for the skip, if any.
  pub fn upstream(&self) -> Option<&Target> {
    match self {
      SkipReason::UpstreamFailed(t) | SkipReason::FailFast(t) => Some(t),
      SkipReason::Cancelled => None,
    }
  }
}

impl fmt::Display for SkipReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SkipReason::UpstreamFailed(t) => write!(f, "dependency {} failed", t),
      SkipReason::FailFast(t) => write!(f, "fail-fast after {} failed", t),
      SkipReason::Cancelled => f.write_str("build cancelled"),
    }
  }
}

/// Errors that abort a whole run. Per-action failures are recorded in the
/// build result instead.
#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  /// The cache is damaged beyond repair.
  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error("io error on {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("result aggregator stopped unexpectedly")]
  AggregatorClosed,
}

/// Configuration for a build run.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of actions executing at once. Zero is treated as one.
  pub concurrency: usize,

  /// Stop dispatching new actions after the first failure.
  pub fail_fast: bool,

  /// Default per-action timeout. An action's own timeout takes precedence.
  pub action_timeout: Option<Duration>,

  /// How long in-flight actions may keep running after cancellation before
  /// they are abandoned.
  pub cancel_grace: Duration,

  /// Shell to use for command steps. If None, uses /bin/sh (Unix) or
  /// PowerShell (Windows).
  pub shell: Option<String>,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      concurrency: num_cpus(),
      fail_fast: false,
      action_timeout: None,
      cancel_grace: Duration::from_secs(10),
      shell: None,
    }
  }
}

/// Get the number of CPUs for default concurrency.
pub fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
