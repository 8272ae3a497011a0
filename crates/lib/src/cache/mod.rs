//! Content-addressed artifact cache.
//!
//! Artifacts are stored by the fingerprint of the action that produced them.
//! A [`TieredCache`] combines a local [`CacheTier`] (disk or memory) with an
//! optional [`RemoteCache`]; local misses fall through to the remote, and
//! remote hits are copied back into the local tier.
//!
//! Entries are immutable once written. Concurrent writers of the same
//! fingerprint race to publish and exactly one write wins; readers never see
//! a partially written entry.

mod disk;
mod lru;
mod memory;
mod remote;
mod tiered;

use std::io;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::Artifact;
use crate::rulekey::Fingerprint;
use crate::util::hash::ContentHash;

pub use disk::DiskCache;
pub use memory::MemoryCache;
pub use remote::{HttpRemoteCache, RemoteCache, TierRemote};
pub use tiered::TieredCache;

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("cache io error on {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: io::Error,
  },

  /// Stored bytes do not match the recorded digest. The entry has been removed.
  #[error("corrupt cache entry {fingerprint}: expected digest {expected}, found {actual}")]
  Corrupt {
    fingerprint: Fingerprint,
    expected: String,
    actual: String,
  },

  #[error("invalid cache metadata at {path}: {message}")]
  Metadata { path: String, message: String },

  #[error("remote cache error: {0}")]
  Remote(String),

  /// The cache is damaged and cannot be repaired; the build must stop.
  #[error("unrecoverable cache error for {fingerprint}: {message}")]
  Unrecoverable { fingerprint: Fingerprint, message: String },
}

impl CacheError {
  pub(crate) fn io(path: &Path, source: io::Error) -> Self {
    CacheError::Io {
      path: path.display().to_string(),
      source,
    }
  }

  /// Whether the error must abort the build rather than count as a miss.
  pub fn is_fatal(&self) -> bool {
    matches!(self, CacheError::Unrecoverable { .. })
  }
}

/// Metadata stored next to every cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
  pub fingerprint: Fingerprint,
  pub size: u64,
  /// SHA-256 of the artifact bytes.
  pub digest: ContentHash,
  /// Where the bytes live (a path for disk tiers, a tier name otherwise).
  pub location: String,
}

impl ArtifactMeta {
  pub fn for_artifact(fingerprint: Fingerprint, artifact: &Artifact, location: String) -> Self {
    Self {
      fingerprint,
      size: artifact.len(),
      digest: artifact.digest().clone(),
      location,
    }
  }
}

/// A cached artifact and its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub meta: ArtifactMeta,
  pub artifact: Artifact,
}

/// Occupancy of a cache tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub entries: usize,
  pub bytes: u64,
  pub max_bytes: Option<u64>,
}

/// Outcome of a garbage collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
  pub entries_removed: usize,
  pub bytes_freed: u64,
}

/// A storage tier mapping fingerprints to artifacts.
#[async_trait]
pub trait CacheTier: Send + Sync + std::fmt::Debug {
  /// Short name used in logs (e.g. `disk`, `memory`).
  fn name(&self) -> &str;

  async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError>;

  /// Store an artifact. If an entry already exists, it is kept and its
  /// metadata returned.
  async fn put(&self, fingerprint: &Fingerprint, artifact: &Artifact) -> Result<ArtifactMeta, CacheError>;

  async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError>;
}

/// Check that cached bytes still match their recorded digest.
pub(crate) fn verify(meta: &ArtifactMeta, artifact: &Artifact) -> Result<(), CacheError> {
  if artifact.digest() != &meta.digest {
    return Err(CacheError::Corrupt {
      fingerprint: meta.fingerprint,
      expected: meta.digest.0.clone(),
      actual: artifact.digest().0.clone(),
    });
  }
  Ok(())
}
