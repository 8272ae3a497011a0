//! Rule keys: content fingerprints of actions.
//!
//! A fingerprint is the SHA-256 of a canonical JSON serialization of
//! everything an action declares: its type tag, target, sorted configuration,
//! transformation fields, declared outputs, the fingerprints of its
//! dependencies (in declaration order) and the content hashes of its direct
//! file inputs. Nothing else (time, undeclared files, environment) goes in,
//! so the key is stable across runs and machines.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::action::{Action, Fingerprintable, Identifiable, Target};
use crate::consts::RULE_KEY_VERSION;
use crate::graph::ActionGraph;
use crate::util::hash::hash_file;

#[derive(Debug, Error)]
pub enum RuleKeyError {
  #[error("failed to hash input {path} of {target}: {message}")]
  InputHash {
    target: Target,
    path: String,
    message: String,
  },

  #[error("{target} declares {expected} dependencies but {actual} fingerprints were supplied")]
  DependencyCount {
    target: Target,
    expected: usize,
    actual: usize,
  },

  #[error("missing fingerprint for dependency {dependency} of {target}")]
  MissingDependency { target: Target, dependency: Target },

  #[error("invalid fingerprint `{0}`")]
  InvalidHex(String),

  #[error("failed to serialize rule key: {0}")]
  Serialize(#[from] serde_json::Error),
}

/// Fixed-length digest identifying an action's output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
  pub fn from_bytes(bytes: [u8; 32]) -> Self {
    Self(bytes)
  }

  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }

  pub fn from_hex(s: &str) -> Result<Self, RuleKeyError> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(s, &mut bytes).map_err(|_| RuleKeyError::InvalidHex(s.to_string()))?;
    Ok(Self(bytes))
  }

  /// Digest arbitrary bytes. Mostly useful for tests and fixtures.
  pub fn of(data: &[u8]) -> Self {
    Self(Sha256::digest(data).into())
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_hex())
  }
}

impl fmt::Debug for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Fingerprint({})", &self.to_hex()[..12])
  }
}

impl Serialize for Fingerprint {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_hex())
  }
}

impl<'de> Deserialize<'de> for Fingerprint {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    Fingerprint::from_hex(&s).map_err(serde::de::Error::custom)
  }
}

/// Canonical rule key input. Field order is part of the key format.
#[derive(Serialize)]
struct RuleKeyInput<'a> {
  version: u32,
  type_tag: &'a str,
  target: &'a Target,
  config: &'a BTreeMap<String, String>,
  step: BTreeMap<String, String>,
  outputs: &'a [String],
  deps: Vec<String>,
  files: Vec<(String, String)>,
}

/// Compute the fingerprint of an action.
///
/// `deps` must hold one fingerprint per declared dependency, in declaration
/// order. Relative file inputs are resolved against `workspace`.
pub fn fingerprint(action: &Action, deps: &[Fingerprint], workspace: &Path) -> Result<Fingerprint, RuleKeyError> {
  if deps.len() != action.deps().len() {
    return Err(RuleKeyError::DependencyCount {
      target: action.target().clone(),
      expected: action.deps().len(),
      actual: deps.len(),
    });
  }

  let mut files = Vec::with_capacity(action.file_inputs().len());
  for input in action.file_inputs() {
    let content = hash_file(&workspace.join(input)).map_err(|e| RuleKeyError::InputHash {
      target: action.target().clone(),
      path: input.display().to_string(),
      message: e.to_string(),
    })?;
    files.push((key_path(input), content.0));
  }

  let key = RuleKeyInput {
    version: RULE_KEY_VERSION,
    type_tag: action.type_tag(),
    target: action.target(),
    config: action.configuration(),
    step: action.step_fields(),
    outputs: action.declared_outputs(),
    deps: deps.iter().map(Fingerprint::to_hex).collect(),
    files,
  };

  let serialized = serde_json::to_vec(&key)?;
  Ok(Fingerprint(Sha256::digest(&serialized).into()))
}

/// Fingerprint every action of a graph, dependencies first.
pub fn fingerprint_all(graph: &ActionGraph, workspace: &Path) -> Result<HashMap<Target, Fingerprint>, RuleKeyError> {
  let mut keys: HashMap<Target, Fingerprint> = HashMap::with_capacity(graph.len());

  for layer in graph.topological_layers() {
    for target in layer {
      let Some(action) = graph.get(&target) else {
        continue;
      };
      let mut deps = Vec::with_capacity(action.deps().len());
      for dep in action.deps() {
        let fp = keys.get(dep).ok_or_else(|| RuleKeyError::MissingDependency {
          target: target.clone(),
          dependency: dep.clone(),
        })?;
        deps.push(*fp);
      }
      let fp = fingerprint(action, &deps, workspace)?;
      keys.insert(target, fp);
    }
  }

  Ok(keys)
}

/// Separator-normalized form of an input path.
fn key_path(path: &Path) -> String {
  path
    .components()
    .map(|c| c.as_os_str().to_string_lossy().into_owned())
    .collect::<Vec<_>>()
    .join("/")
}
