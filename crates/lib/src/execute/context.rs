//! Per-invocation build context.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::action::Target;
use crate::cache::TieredCache;
use crate::consts::{DEFAULT_OUTPUT_DIR, SCRATCH_DIR};
use crate::result::EventObserver;

/// Everything a run needs besides the graph and its configuration.
///
/// Passed explicitly to [`super::run`]; nothing here is stored on actions.
#[derive(Clone)]
pub struct BuildContext {
  /// Root that relative file inputs and command working directories resolve
  /// against.
  pub workspace: PathBuf,
  /// Where action outputs are materialized.
  pub output_root: PathBuf,
  pub cache: TieredCache,
  /// Build-wide cancellation signal.
  pub cancel: CancellationToken,
  /// Called for every build event, in order.
  pub observer: Option<EventObserver>,
}

impl BuildContext {
  /// Context for `workspace` with outputs under `<workspace>/keel-out` and no cache.
  pub fn new(workspace: impl Into<PathBuf>) -> Self {
    let workspace = workspace.into();
    let output_root = workspace.join(DEFAULT_OUTPUT_DIR);
    Self {
      workspace,
      output_root,
      cache: TieredCache::disabled(),
      cancel: CancellationToken::new(),
      observer: None,
    }
  }

  pub fn with_output_root(mut self, output_root: impl Into<PathBuf>) -> Self {
    self.output_root = output_root.into();
    self
  }

  pub fn with_cache(mut self, cache: TieredCache) -> Self {
    self.cache = cache;
    self
  }

  pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn with_observer(mut self, observer: EventObserver) -> Self {
    self.observer = Some(observer);
    self
  }

  /// Directory holding a target's materialized outputs:
  /// `<output_root>/<package>/__<name>__`.
  ///
  /// The decorated name keeps targets from colliding with sub-packages.
  pub fn output_dir(&self, target: &Target) -> PathBuf {
    let mut dir = self.output_root.clone();
    for segment in target.package().split('/').filter(|s| !s.is_empty()) {
      dir.push(segment);
    }
    dir.join(format!("__{}__", target.name()))
  }

  pub(crate) fn scratch_root(&self) -> PathBuf {
    self.output_root.join(SCRATCH_DIR)
  }

  pub fn workspace(&self) -> &Path {
    &self.workspace
  }
}

impl std::fmt::Debug for BuildContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BuildContext")
      .field("workspace", &self.workspace)
      .field("output_root", &self.output_root)
      .field("cache", &self.cache)
      .field("cancelled", &self.cancel.is_cancelled())
      .field("observer", &self.observer.is_some())
      .finish()
  }
}
