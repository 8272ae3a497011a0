//! Serialized form of actions, as found in graph files.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::actions::{CmdStep, NoopStep, WriteStep};
use super::{Action, CachePolicy, Executable, Target};

/// The transformation of a serialized action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepSpec {
  Cmd {
    cmd: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
  },
  Write {
    content: String,
  },
  #[default]
  Noop,
}

impl StepSpec {
  pub fn into_step(self) -> Arc<dyn Executable> {
    match self {
      StepSpec::Cmd { cmd, env, cwd } => Arc::new(CmdStep { cmd, env, cwd }),
      StepSpec::Write { content } => Arc::new(WriteStep { content }),
      StepSpec::Noop => Arc::new(NoopStep),
    }
  }
}

/// One action as declared in a graph file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionSpec {
  pub target: Target,
  #[serde(default)]
  pub deps: Vec<Target>,
  #[serde(default)]
  pub inputs: Vec<PathBuf>,
  #[serde(default)]
  pub config: BTreeMap<String, String>,
  #[serde(default)]
  pub outputs: Vec<String>,
  #[serde(default)]
  pub step: StepSpec,
  #[serde(default)]
  pub cache: CachePolicy,
  #[serde(default)]
  pub timeout_secs: Option<u64>,
}

impl ActionSpec {
  pub fn into_action(self) -> Action {
    let mut action = Action::new(self.target, self.step.into_step())
      .with_deps(self.deps)
      .with_inputs(self.inputs)
      .with_outputs(self.outputs)
      .with_cache_policy(self.cache);
    for (key, value) in &self.config {
      action = action.with_config(key, value);
    }
    if let Some(secs) = self.timeout_secs {
      action = action.with_timeout(Duration::from_secs(secs));
    }
    action
  }
}
