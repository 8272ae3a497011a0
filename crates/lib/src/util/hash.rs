//! Hashing utilities for content addressing and verification.
//!
//! This module provides:
//! - `ContentHash`: A full 64-character SHA-256 hash for content verification
//! - `hash_file()`: Single file hashing
//! - `hash_bytes()`: Arbitrary byte hashing

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A full 64-character SHA-256 hash for content verification.
///
/// # Format
///
/// The hash is a lowercase hexadecimal string (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error while hashing a file.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },
}

/// Hash a file's contents.
///
/// Returns the full 64-character SHA-256 hash of the file.
pub fn hash_file(path: &Path) -> Result<ContentHash, HashError> {
  let mut file = fs::File::open(path).map_err(|e| HashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  })?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(|e| HashError::ReadFile {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Hash arbitrary bytes.
///
/// Returns the full 64-character SHA-256 hash.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn hash_file_works() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("test.txt");
    fs::write(&file_path, "hello world").unwrap();

    let hash = hash_file(&file_path).unwrap();
    assert_eq!(hash.0.len(), 64);

    // Same content = same hash
    let hash2 = hash_file(&file_path).unwrap();
    assert_eq!(hash, hash2);
  }

  #[test]
  fn hash_file_matches_hash_bytes() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("data.bin");
    fs::write(&file_path, b"same bytes").unwrap();

    assert_eq!(hash_file(&file_path).unwrap(), hash_bytes(b"same bytes"));
  }

  #[test]
  fn hash_file_missing_is_error() {
    let temp = tempdir().unwrap();
    let err = hash_file(&temp.path().join("nope")).unwrap_err();
    assert!(err.to_string().contains("nope"));
  }

  #[test]
  fn hash_bytes_known_value() {
    assert_eq!(
      hash_bytes(b"").0,
      "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
  }
}
