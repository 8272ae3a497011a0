//! Build artifacts: the bytes an action produces and how they move between
//! output directories and the cache.
//!
//! Declared outputs are packed into a deterministic tar archive (fixed mtime,
//! owner and mode normalization, declaration order) so that identical outputs
//! always produce identical artifact bytes and digests. An action with no
//! declared outputs produces an empty artifact.

use std::fs;
use std::io;
use std::path::{Component, Path};

use thiserror::Error;
use walkdir::WalkDir;

use crate::util::hash::{ContentHash, hash_bytes};

/// Errors produced while packing or unpacking artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
  #[error("declared output `{0}` was not produced")]
  MissingOutput(String),

  #[error("invalid output path `{0}`: must be relative and stay inside the output directory")]
  InvalidOutputPath(String),

  #[error("io error on {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: io::Error,
  },
}

impl ArtifactError {
  fn io(path: &Path, source: io::Error) -> Self {
    ArtifactError::Io {
      path: path.display().to_string(),
      source,
    }
  }
}

/// Output bytes of an action together with their SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
  content: Vec<u8>,
  digest: ContentHash,
}

impl Artifact {
  pub fn new(content: Vec<u8>) -> Self {
    let digest = hash_bytes(&content);
    Self { content, digest }
  }

  /// The artifact of an action with no outputs.
  pub fn empty() -> Self {
    Self::new(Vec::new())
  }

  pub fn content(&self) -> &[u8] {
    &self.content
  }

  pub fn digest(&self) -> &ContentHash {
    &self.digest
  }

  pub fn len(&self) -> u64 {
    self.content.len() as u64
  }

  pub fn is_empty(&self) -> bool {
    self.content.is_empty()
  }

  pub fn into_content(self) -> Vec<u8> {
    self.content
  }
}

/// Check that a declared output path is relative and cannot escape its
/// output directory.
pub fn validate_output_path(output: &str) -> Result<(), ArtifactError> {
  let path = Path::new(output);
  if output.is_empty() || path.is_absolute() {
    return Err(ArtifactError::InvalidOutputPath(output.to_string()));
  }
  let escapes = path
    .components()
    .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
  if escapes {
    return Err(ArtifactError::InvalidOutputPath(output.to_string()));
  }
  Ok(())
}

/// Pack the declared outputs found under `out_dir` into an artifact.
///
/// Outputs may be files or directories; directories are walked in sorted
/// order. Every declared output must exist.
pub fn pack_outputs(out_dir: &Path, outputs: &[String]) -> Result<Artifact, ArtifactError> {
  if outputs.is_empty() {
    return Ok(Artifact::empty());
  }

  let mut builder = tar::Builder::new(Vec::new());
  builder.mode(tar::HeaderMode::Deterministic);

  for output in outputs {
    validate_output_path(output)?;
    let path = out_dir.join(output);
    let metadata = fs::symlink_metadata(&path).map_err(|e| {
      if e.kind() == io::ErrorKind::NotFound {
        ArtifactError::MissingOutput(output.clone())
      } else {
        ArtifactError::io(&path, e)
      }
    })?;

    if metadata.is_dir() {
      for entry in WalkDir::new(&path).sort_by_file_name() {
        let entry = entry.map_err(|e| ArtifactError::io(&path, io::Error::other(e)))?;
        let rel = entry.path().strip_prefix(out_dir).unwrap_or(entry.path());
        append_entry(&mut builder, entry.path(), rel)?;
      }
    } else {
      append_entry(&mut builder, &path, Path::new(output))?;
    }
  }

  let content = builder.into_inner().map_err(|e| ArtifactError::io(out_dir, e))?;
  Ok(Artifact::new(content))
}

fn append_entry(builder: &mut tar::Builder<Vec<u8>>, path: &Path, name: &Path) -> Result<(), ArtifactError> {
  builder
    .append_path_with_name(path, name)
    .map_err(|e| ArtifactError::io(path, e))
}

/// [`pack_outputs`] on the blocking pool.
pub async fn pack_outputs_async(out_dir: &Path, outputs: &[String]) -> Result<Artifact, ArtifactError> {
  let dir = out_dir.to_path_buf();
  let outputs = outputs.to_vec();
  tokio::task::spawn_blocking(move || pack_outputs(&dir, &outputs))
    .await
    .map_err(|e| ArtifactError::io(out_dir, io::Error::other(e)))?
}

/// [`materialize`] on the blocking pool.
pub async fn materialize_async(artifact: Artifact, dest: &Path) -> Result<(), ArtifactError> {
  let dir = dest.to_path_buf();
  tokio::task::spawn_blocking(move || materialize(&artifact, &dir))
    .await
    .map_err(|e| ArtifactError::io(dest, io::Error::other(e)))?
}

/// Replace the contents of `dest` with the files packed in `artifact`.
pub fn materialize(artifact: &Artifact, dest: &Path) -> Result<(), ArtifactError> {
  if dest.exists() {
    fs::remove_dir_all(dest).map_err(|e| ArtifactError::io(dest, e))?;
  }
  fs::create_dir_all(dest).map_err(|e| ArtifactError::io(dest, e))?;

  if artifact.is_empty() {
    return Ok(());
  }

  let mut archive = tar::Archive::new(artifact.content());
  archive.set_preserve_mtime(false);
  archive.unpack(dest).map_err(|e| ArtifactError::io(dest, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn no_outputs_is_empty_artifact() {
    let temp = TempDir::new().unwrap();
    let artifact = pack_outputs(temp.path(), &[]).unwrap();
    assert!(artifact.is_empty());
    assert_eq!(artifact.digest(), Artifact::empty().digest());
  }

  #[test]
  fn packing_is_deterministic() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    for dir in [a.path(), b.path()] {
      fs::create_dir_all(dir.join("gen")).unwrap();
      fs::write(dir.join("gen/x.h"), "#define X 1\n").unwrap();
      fs::write(dir.join("lib.a"), "archive").unwrap();
    }

    let outputs = vec!["lib.a".to_string(), "gen".to_string()];
    let first = pack_outputs(a.path(), &outputs).unwrap();
    let second = pack_outputs(b.path(), &outputs).unwrap();
    assert_eq!(first.digest(), second.digest());
  }

  #[test]
  fn missing_output_is_reported() {
    let temp = TempDir::new().unwrap();
    let err = pack_outputs(temp.path(), &["out.txt".to_string()]).unwrap_err();
    assert!(matches!(err, ArtifactError::MissingOutput(ref o) if o == "out.txt"));
  }

  #[test]
  fn rejects_escaping_outputs() {
    assert!(validate_output_path("../secret").is_err());
    assert!(validate_output_path("/etc/passwd").is_err());
    assert!(validate_output_path("").is_err());
    assert!(validate_output_path("a/./b.txt").is_ok());
  }

  #[tokio::test]
  async fn async_variants_match_blocking_ones() {
    let src = TempDir::new().unwrap();
    fs::write(src.path().join("out.txt"), "payload").unwrap();
    let outputs = vec!["out.txt".to_string()];

    let artifact = pack_outputs_async(src.path(), &outputs).await.unwrap();
    assert_eq!(artifact.digest(), pack_outputs(src.path(), &outputs).unwrap().digest());

    let dest = TempDir::new().unwrap();
    materialize_async(artifact, &dest.path().join("pkg")).await.unwrap();
    assert_eq!(fs::read_to_string(dest.path().join("pkg/out.txt")).unwrap(), "payload");
  }

  #[test]
  fn materialize_restores_files_and_clears_stale_ones() {
    let src = TempDir::new().unwrap();
    fs::create_dir_all(src.path().join("docs")).unwrap();
    fs::write(src.path().join("docs/index.html"), "<html/>").unwrap();
    let artifact = pack_outputs(src.path(), &["docs".to_string()]).unwrap();

    let dest = TempDir::new().unwrap();
    let target_dir = dest.path().join("pkg/site");
    fs::create_dir_all(&target_dir).unwrap();
    fs::write(target_dir.join("stale.txt"), "old").unwrap();

    materialize(&artifact, &target_dir).unwrap();

    assert_eq!(
      fs::read_to_string(target_dir.join("docs/index.html")).unwrap(),
      "<html/>"
    );
    assert!(!target_dir.join("stale.txt").exists());
  }
}
