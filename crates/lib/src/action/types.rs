use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::artifact::{Artifact, ArtifactError};

use super::target::Target;

/// Stable identity of a unit of work.
pub trait Identifiable {
  fn target(&self) -> &Target;
}

/// Everything a rule key is computed from, apart from dependency fingerprints.
pub trait Fingerprintable {
  /// Tag naming the kind of transformation (e.g. `cmd`, `write`).
  fn type_tag(&self) -> &str;

  /// Declared configuration, sorted by key.
  fn configuration(&self) -> &BTreeMap<String, String>;

  /// Transformation-specific fields (command line, literal content, ...).
  fn step_fields(&self) -> BTreeMap<String, String>;

  /// Direct file inputs, relative to the workspace root.
  fn file_inputs(&self) -> &[PathBuf];

  /// Declared output paths, relative to the action's output directory.
  fn declared_outputs(&self) -> &[String];
}

/// Whether an action's artifact may be stored in and served from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
  #[default]
  Cacheable,
  /// Always executed; the artifact is never published.
  Uncacheable,
}

pub trait Cacheable {
  fn cache_policy(&self) -> CachePolicy;

  fn is_cacheable(&self) -> bool {
    self.cache_policy() == CachePolicy::Cacheable
  }
}

/// Errors a transformation can report.
#[derive(Debug, Error)]
pub enum StepError {
  /// Command exited unsuccessfully.
  #[error("command failed with exit code {code:?}: {cmd}")]
  CmdFailed { cmd: String, code: Option<i32> },

  /// The step observed the cancellation signal and stopped.
  #[error("cancelled")]
  Cancelled,

  #[error(transparent)]
  Artifact(#[from] ArtifactError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// Free-form failure from a custom transformation.
  #[error("{0}")]
  Failed(String),
}

/// Everything a transformation may touch while executing.
#[derive(Debug, Clone)]
pub struct ExecContext {
  pub target: Target,
  /// Workspace root; relative file inputs resolve against it.
  pub workspace: PathBuf,
  /// Fresh, empty directory the transformation writes its outputs into.
  pub out_dir: PathBuf,
  pub outputs: Vec<String>,
  /// Checked at safe points; a cancelled step returns `StepError::Cancelled`.
  pub cancel: CancellationToken,
  /// Shell override for command steps.
  pub shell: Option<String>,
}

/// A deterministic transformation producing an action's artifact.
#[async_trait]
pub trait Executable: Send + Sync + fmt::Debug {
  fn type_tag(&self) -> &str;

  /// Fields that distinguish two transformations of the same type.
  fn key_fields(&self) -> BTreeMap<String, String> {
    BTreeMap::new()
  }

  async fn execute(&self, ctx: &ExecContext) -> Result<Artifact, StepError>;
}

/// A node of the action graph.
///
/// Composed from an identity, a transformation and a cache policy; immutable
/// once handed to the graph. Equality and ordering consider only the target.
#[derive(Debug, Clone)]
pub struct Action {
  target: Target,
  deps: Vec<Target>,
  inputs: Vec<PathBuf>,
  config: BTreeMap<String, String>,
  outputs: Vec<String>,
  step: Arc<dyn Executable>,
  cache_policy: CachePolicy,
  timeout: Option<Duration>,
}

impl Action {
  pub fn new(target: Target, step: Arc<dyn Executable>) -> Self {
    Self {
      target,
      deps: Vec::new(),
      inputs: Vec::new(),
      config: BTreeMap::new(),
      outputs: Vec::new(),
      step,
      cache_policy: CachePolicy::default(),
      timeout: None,
    }
  }

  pub fn with_deps(mut self, deps: impl IntoIterator<Item = Target>) -> Self {
    for dep in deps {
      if !self.deps.contains(&dep) {
        self.deps.push(dep);
      }
    }
    self
  }

  pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = PathBuf>) -> Self {
    self.inputs.extend(inputs);
    self
  }

  pub fn with_config(mut self, key: &str, value: &str) -> Self {
    self.config.insert(key.to_string(), value.to_string());
    self
  }

  pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = String>) -> Self {
    self.outputs.extend(outputs);
    self
  }

  pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
    self.cache_policy = policy;
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  /// Dependencies in declaration order, without duplicates.
  pub fn deps(&self) -> &[Target] {
    &self.deps
  }

  pub fn step(&self) -> &Arc<dyn Executable> {
    &self.step
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout
  }
}

impl Identifiable for Action {
  fn target(&self) -> &Target {
    &self.target
  }
}

impl Fingerprintable for Action {
  fn type_tag(&self) -> &str {
    self.step.type_tag()
  }

  fn configuration(&self) -> &BTreeMap<String, String> {
    &self.config
  }

  fn step_fields(&self) -> BTreeMap<String, String> {
    self.step.key_fields()
  }

  fn file_inputs(&self) -> &[PathBuf] {
    &self.inputs
  }

  fn declared_outputs(&self) -> &[String] {
    &self.outputs
  }
}

impl Cacheable for Action {
  fn cache_policy(&self) -> CachePolicy {
    self.cache_policy
  }
}

impl PartialEq for Action {
  fn eq(&self, other: &Self) -> bool {
    self.target == other.target
  }
}

impl Eq for Action {}

impl PartialOrd for Action {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Action {
  fn cmp(&self, other: &Self) -> Ordering {
    self.target.cmp(&other.target)
  }
}
