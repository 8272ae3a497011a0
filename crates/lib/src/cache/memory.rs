//! In-memory cache tier.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::lru::LruIndex;
use super::{ArtifactMeta, CacheEntry, CacheError, CacheStats, CacheTier};
use crate::artifact::Artifact;
use crate::rulekey::Fingerprint;

#[derive(Debug, Default)]
struct State {
  entries: HashMap<Fingerprint, CacheEntry>,
  index: LruIndex,
}

/// Process-local cache with the same LRU rules as [`super::DiskCache`].
///
/// Reads copy the entry out while holding the lock, so an entry being read
/// can never be evicted from under the reader.
#[derive(Debug, Default)]
pub struct MemoryCache {
  state: Mutex<State>,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_max_bytes(max_bytes: u64) -> Self {
    Self {
      state: Mutex::new(State {
        entries: HashMap::new(),
        index: LruIndex::new(Some(max_bytes)),
      }),
    }
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn stats(&self) -> CacheStats {
    let state = self.state();
    CacheStats {
      entries: state.index.len(),
      bytes: state.index.total_bytes(),
      max_bytes: state.index.max_bytes(),
    }
  }
}

#[async_trait]
impl CacheTier for MemoryCache {
  fn name(&self) -> &str {
    "memory"
  }

  async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
    let mut state = self.state();
    let entry = state.entries.get(fingerprint).cloned();
    if entry.is_some() {
      state.index.touch(fingerprint);
    }
    Ok(entry)
  }

  async fn put(&self, fingerprint: &Fingerprint, artifact: &Artifact) -> Result<ArtifactMeta, CacheError> {
    let mut state = self.state();
    if let Some(existing) = state.entries.get(fingerprint) {
      return Ok(existing.meta.clone());
    }

    let meta = ArtifactMeta::for_artifact(*fingerprint, artifact, "memory".to_string());
    state.entries.insert(
      *fingerprint,
      CacheEntry {
        meta: meta.clone(),
        artifact: artifact.clone(),
      },
    );
    state.index.insert(*fingerprint, meta.size);

    for victim in state.index.over_budget(Some(fingerprint)) {
      state.index.remove(&victim);
      state.entries.remove(&victim);
      debug!(fingerprint = %victim, "evicted from memory cache");
    }

    Ok(meta)
  }

  async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
    Ok(self.state().entries.contains_key(fingerprint))
  }
}
