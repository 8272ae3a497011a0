//! Disk-backed cache tier.
//!
//! Layout: `<root>/objects/<first 2 hex chars>/<remaining 62 hex chars>` for
//! the artifact bytes, with a `.meta.json` sidecar next to each blob. The
//! sidecar is published last and is what makes an entry visible.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::lru::LruIndex;
use super::{ArtifactMeta, CacheEntry, CacheError, CacheStats, CacheTier, GcStats, verify};
use crate::artifact::Artifact;
use crate::rulekey::Fingerprint;

const META_SUFFIX: &str = ".meta.json";

/// Filesystem cache with an optional LRU size bound.
///
/// Clones share the same index. The async tier methods run their file I/O on
/// the blocking pool.
#[derive(Debug, Clone)]
pub struct DiskCache {
  root: PathBuf,
  objects_dir: PathBuf,
  index: Arc<Mutex<LruIndex>>,
}

/// Unpins an entry when a read finishes, however it finishes.
struct PinGuard<'a> {
  cache: &'a DiskCache,
  fingerprint: Fingerprint,
}

impl Drop for PinGuard<'_> {
  fn drop(&mut self) {
    self.cache.index().unpin(&self.fingerprint);
  }
}

impl DiskCache {
  /// Open (or create) a cache rooted at `root`, rebuilding the in-memory
  /// index from the sidecars found on disk.
  pub fn open(root: impl AsRef<Path>, max_bytes: Option<u64>) -> Result<Self, CacheError> {
    let root = root.as_ref().to_path_buf();
    let objects_dir = root.join("objects");
    fs::create_dir_all(&objects_dir).map_err(|e| CacheError::io(&objects_dir, e))?;

    let mut index = LruIndex::new(max_bytes);
    for entry in WalkDir::new(&objects_dir).min_depth(2).max_depth(2) {
      let entry = match entry {
        Ok(entry) => entry,
        Err(e) => {
          warn!(error = %e, "skipping unreadable cache path");
          continue;
        }
      };
      let path = entry.path();
      if !path.to_string_lossy().ends_with(META_SUFFIX) {
        continue;
      }
      match read_meta(path) {
        Ok(meta) => {
          let stamp = blob_mtime(&path_for_blob(path)).unwrap_or(0);
          index.insert_with_stamp(meta.fingerprint, meta.size, stamp);
        }
        Err(e) => warn!(path = ?path, error = %e, "skipping invalid cache sidecar"),
      }
    }

    info!(root = ?root, entries = index.len(), bytes = index.total_bytes(), "opened disk cache");

    Ok(Self {
      root,
      objects_dir,
      index: Arc::new(Mutex::new(index)),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn index(&self) -> MutexGuard<'_, LruIndex> {
    self.index.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn blob_path(&self, fp: &Fingerprint) -> PathBuf {
    let hex = fp.to_hex();
    self.objects_dir.join(&hex[..2]).join(&hex[2..])
  }

  fn meta_path(&self, fp: &Fingerprint) -> PathBuf {
    let hex = fp.to_hex();
    self.objects_dir.join(&hex[..2]).join(format!("{}{}", &hex[2..], META_SUFFIX))
  }

  /// Pin an entry for reading, indexing it first if another process wrote it.
  fn pin(&self, fp: &Fingerprint) -> Result<Option<PinGuard<'_>>, CacheError> {
    let mut index = self.index();
    if !index.pin(fp) {
      let meta_path = self.meta_path(fp);
      if !meta_path.exists() {
        return Ok(None);
      }
      let meta = read_meta(&meta_path)?;
      index.insert(*fp, meta.size);
      index.pin(fp);
    }
    Ok(Some(PinGuard {
      cache: self,
      fingerprint: *fp,
    }))
  }

  /// Delete an entry's files. Sidecar first, so a half-removed entry is a miss.
  fn remove_files(&self, fp: &Fingerprint) -> io::Result<()> {
    for path in [self.meta_path(fp), self.blob_path(fp)] {
      match fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
      }
    }
    Ok(())
  }

  /// Evict least recently used entries beyond `limit`, sparing `protect`.
  fn evict(&self, index: &mut LruIndex, limit: Option<u64>, protect: Option<&Fingerprint>) -> GcStats {
    let victims = match limit {
      Some(limit) => index.victims(limit, protect),
      None => index.over_budget(protect),
    };

    let mut stats = GcStats::default();
    for fp in victims {
      if let Err(e) = self.remove_files(&fp) {
        warn!(fingerprint = %fp, error = %e, "failed to evict cache entry");
        continue;
      }
      if let Some(size) = index.remove(&fp) {
        debug!(fingerprint = %fp, size, "evicted cache entry");
        stats.entries_removed += 1;
        stats.bytes_freed += size;
      }
    }
    stats
  }

  pub fn stats(&self) -> CacheStats {
    let index = self.index();
    CacheStats {
      entries: index.len(),
      bytes: index.total_bytes(),
      max_bytes: index.max_bytes(),
    }
  }

  /// Evict least recently used entries until at most `max_bytes` remain.
  pub fn gc(&self, max_bytes: u64) -> GcStats {
    let mut index = self.index();
    let stats = self.evict(&mut index, Some(max_bytes), None);
    info!(
      removed = stats.entries_removed,
      freed = stats.bytes_freed,
      "cache garbage collection complete"
    );
    stats
  }

  fn read_entry(&self, fp: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
    let Some(_pin) = self.pin(fp)? else {
      return Ok(None);
    };

    let meta = read_meta(&self.meta_path(fp))?;
    let blob_path = self.blob_path(fp);
    let content = match fs::read(&blob_path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        return Err(CacheError::Metadata {
          path: blob_path.display().to_string(),
          message: "sidecar present but artifact missing".to_string(),
        });
      }
      Err(e) => return Err(CacheError::io(&blob_path, e)),
    };

    let artifact = Artifact::new(content);
    verify(&meta, &artifact)?;
    self.index().touch(fp);
    // The blob mtime seeds the access stamp when the index is rebuilt
    refresh_mtime(&blob_path);
    Ok(Some(CacheEntry { meta, artifact }))
  }

  /// Drop a damaged entry. Failing to do so leaves the cache unusable.
  fn discard(&self, fp: &Fingerprint, reason: CacheError) -> CacheError {
    warn!(fingerprint = %fp, error = %reason, "removing damaged cache entry");
    let mut index = self.index();
    match self.remove_files(fp) {
      Ok(()) => {
        index.remove(fp);
        reason
      }
      Err(e) => CacheError::Unrecoverable {
        fingerprint: *fp,
        message: format!("{} (removal failed: {})", reason, e),
      },
    }
  }

  fn get_blocking(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
    match self.read_entry(fingerprint) {
      Ok(entry) => {
        debug!(fingerprint = %fingerprint, hit = entry.is_some(), "disk cache lookup");
        Ok(entry)
      }
      Err(e @ (CacheError::Corrupt { .. } | CacheError::Metadata { .. })) => Err(self.discard(fingerprint, e)),
      Err(e) => Err(e),
    }
  }

  fn put_blocking(&self, fingerprint: &Fingerprint, artifact: &Artifact) -> Result<ArtifactMeta, CacheError> {
    let meta_path = self.meta_path(fingerprint);
    if meta_path.exists() {
      return read_meta(&meta_path);
    }
    let meta = self.write_entry(fingerprint, artifact)?;
    debug!(fingerprint = %fingerprint, size = meta.size, "stored artifact in disk cache");
    Ok(meta)
  }

  /// Run `op` against a clone of this cache on the blocking pool.
  async fn blocking<T, F>(&self, op: F) -> Result<T, CacheError>
  where
    T: Send + 'static,
    F: FnOnce(&DiskCache) -> Result<T, CacheError> + Send + 'static,
  {
    let cache = self.clone();
    tokio::task::spawn_blocking(move || op(&cache))
      .await
      .map_err(|e| CacheError::io(&self.objects_dir, io::Error::other(e)))?
  }

  fn write_entry(&self, fp: &Fingerprint, artifact: &Artifact) -> Result<ArtifactMeta, CacheError> {
    let blob_path = self.blob_path(fp);
    let meta_path = self.meta_path(fp);
    let shard_dir = self.objects_dir.join(&fp.to_hex()[..2]);
    fs::create_dir_all(&shard_dir).map_err(|e| CacheError::io(&shard_dir, e))?;

    // Atomic publish: temp file in the shard directory, then a no-clobber
    // rename. Whoever renames first owns the entry.
    let published = persist_new(&shard_dir, &blob_path, artifact.content())?;
    let meta = if published {
      ArtifactMeta::for_artifact(*fp, artifact, blob_path.display().to_string())
    } else {
      debug!(fingerprint = %fp, "artifact already published by another writer");
      let existing = fs::read(&blob_path).map_err(|e| CacheError::io(&blob_path, e))?;
      ArtifactMeta::for_artifact(*fp, &Artifact::new(existing), blob_path.display().to_string())
    };

    let json = serde_json::to_vec_pretty(&meta).map_err(|e| CacheError::Metadata {
      path: meta_path.display().to_string(),
      message: e.to_string(),
    })?;
    if !persist_new(&shard_dir, &meta_path, &json)? {
      return read_meta(&meta_path);
    }

    let mut index = self.index();
    index.insert(*fp, meta.size);
    self.evict(&mut index, None, Some(fp));

    Ok(meta)
  }
}

#[async_trait]
impl CacheTier for DiskCache {
  fn name(&self) -> &str {
    "disk"
  }

  async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
    let fp = *fingerprint;
    self.blocking(move |cache| cache.get_blocking(&fp)).await
  }

  async fn put(&self, fingerprint: &Fingerprint, artifact: &Artifact) -> Result<ArtifactMeta, CacheError> {
    let fp = *fingerprint;
    let artifact = artifact.clone();
    self.blocking(move |cache| cache.put_blocking(&fp, &artifact)).await
  }

  async fn contains(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
    if self.index().contains(fingerprint) {
      return Ok(true);
    }
    let meta_path = self.meta_path(fingerprint);
    tokio::fs::try_exists(&meta_path)
      .await
      .map_err(|e| CacheError::io(&meta_path, e))
  }
}

/// Write `data` to a temp file in `dir` and rename it to `dest` unless `dest`
/// already exists. Returns whether this call published the file.
fn persist_new(dir: &Path, dest: &Path, data: &[u8]) -> Result<bool, CacheError> {
  let mut tmp = NamedTempFile::new_in(dir).map_err(|e| CacheError::io(dir, e))?;
  tmp.write_all(data).map_err(|e| CacheError::io(tmp.path(), e))?;
  tmp.as_file().sync_all().map_err(|e| CacheError::io(tmp.path(), e))?;

  match tmp.persist_noclobber(dest) {
    Ok(_) => Ok(true),
    Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
    Err(e) => Err(CacheError::io(dest, e.error)),
  }
}

fn read_meta(path: &Path) -> Result<ArtifactMeta, CacheError> {
  let bytes = fs::read(path).map_err(|e| CacheError::io(path, e))?;
  serde_json::from_slice(&bytes).map_err(|e| CacheError::Metadata {
    path: path.display().to_string(),
    message: e.to_string(),
  })
}

fn path_for_blob(meta_path: &Path) -> PathBuf {
  let s = meta_path.to_string_lossy();
  PathBuf::from(s.strip_suffix(META_SUFFIX).unwrap_or(&s))
}

fn refresh_mtime(path: &Path) {
  let result = fs::File::options()
    .write(true)
    .open(path)
    .and_then(|file| file.set_modified(SystemTime::now()));
  if let Err(e) = result {
    debug!(path = ?path, error = %e, "failed to refresh cache entry mtime");
  }
}

fn blob_mtime(path: &Path) -> Option<u128> {
  let modified = fs::metadata(path).ok()?.modified().ok()?;
  Some(modified.duration_since(UNIX_EPOCH).ok()?.as_nanos())
}
