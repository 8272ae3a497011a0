//! Local tier plus optional remote, with fill-through.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{ArtifactMeta, CacheEntry, CacheError, CacheTier, RemoteCache, verify};
use crate::artifact::Artifact;
use crate::rulekey::Fingerprint;

/// The cache the scheduler talks to.
///
/// I/O and remote errors are logged and treated as misses; only
/// [`CacheError::Unrecoverable`] is returned to the caller.
#[derive(Debug, Clone, Default)]
pub struct TieredCache {
  local: Option<Arc<dyn CacheTier>>,
  remote: Option<Arc<dyn RemoteCache>>,
}

impl TieredCache {
  /// A cache that never hits and stores nothing.
  pub fn disabled() -> Self {
    Self::default()
  }

  pub fn new(local: Arc<dyn CacheTier>) -> Self {
    Self {
      local: Some(local),
      remote: None,
    }
  }

  pub fn with_remote(mut self, remote: Arc<dyn RemoteCache>) -> Self {
    self.remote = Some(remote);
    self
  }

  pub fn is_enabled(&self) -> bool {
    self.local.is_some() || self.remote.is_some()
  }

  /// Look up an artifact, local tier first.
  ///
  /// A remote hit is written to the local tier before it is returned. If the
  /// local tier already held different bytes for the fingerprint, those are
  /// served instead.
  pub async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
    if let Some(local) = &self.local {
      match local.get(fingerprint).await {
        Ok(Some(entry)) => {
          debug!(fingerprint = %fingerprint, tier = local.name(), "cache hit");
          return Ok(Some(entry));
        }
        Ok(None) => {}
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => warn!(fingerprint = %fingerprint, tier = local.name(), error = %e, "cache read failed, treating as miss"),
      }
    }

    let Some(remote) = &self.remote else {
      return Ok(None);
    };

    let bytes = match remote.get(fingerprint).await {
      Ok(Some(bytes)) => bytes,
      Ok(None) => return Ok(None),
      Err(e) => {
        warn!(fingerprint = %fingerprint, remote = remote.name(), error = %e, "remote cache read failed, treating as miss");
        return Ok(None);
      }
    };

    let artifact = Artifact::new(bytes);
    info!(fingerprint = %fingerprint, remote = remote.name(), size = artifact.len(), "remote cache hit");

    let meta = match &self.local {
      Some(local) => match local.put(fingerprint, &artifact).await {
        Ok(meta) => meta,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
          warn!(fingerprint = %fingerprint, error = %e, "failed to fill local cache");
          ArtifactMeta::for_artifact(*fingerprint, &artifact, remote.name().to_string())
        }
      },
      None => ArtifactMeta::for_artifact(*fingerprint, &artifact, remote.name().to_string()),
    };

    // The local tier keeps the first published entry; serve exactly that.
    if let Err(e) = verify(&meta, &artifact) {
      debug!(fingerprint = %fingerprint, error = %e, "local entry differs from remote bytes");
      if let Some(local) = &self.local
        && let Ok(Some(entry)) = local.get(fingerprint).await
      {
        return Ok(Some(entry));
      }
    }

    Ok(Some(CacheEntry { meta, artifact }))
  }

  /// Publish an artifact to every tier. Failures are logged, never returned,
  /// unless the local tier is damaged beyond repair.
  pub async fn publish(&self, fingerprint: &Fingerprint, artifact: &Artifact) -> Result<(), CacheError> {
    if let Some(local) = &self.local {
      match local.put(fingerprint, artifact).await {
        Ok(meta) => debug!(fingerprint = %fingerprint, size = meta.size, tier = local.name(), "published artifact"),
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => warn!(fingerprint = %fingerprint, error = %e, "failed to publish artifact locally"),
      }
    }

    if let Some(remote) = &self.remote
      && let Err(e) = remote.put(fingerprint, artifact.content()).await
    {
      warn!(fingerprint = %fingerprint, remote = remote.name(), error = %e, "failed to publish artifact remotely");
    }

    Ok(())
  }
}
