//! Settings read from the environment.
//!
//! | Variable               | Meaning                                   |
//! |------------------------|-------------------------------------------|
//! | `KEEL_CACHE_DIR`       | Local cache root (default: XDG cache dir) |
//! | `KEEL_CACHE_MAX_BYTES` | Local cache size bound, e.g. `512M`       |
//! | `KEEL_REMOTE_CACHE`    | Base URL of an HTTP remote cache          |
//! | `KEEL_JOBS`            | Maximum concurrent actions                |
//!
//! Command-line flags override these.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::cache::{CacheError, DiskCache, HttpRemoteCache, TieredCache};
use crate::consts::{ENV_CACHE_DIR, ENV_CACHE_MAX_BYTES, ENV_JOBS, ENV_REMOTE_CACHE};
use crate::execute::ExecuteConfig;
use crate::platform::paths::cache_dir;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value `{value}` for {var}: {reason}")]
pub struct ConfigError {
  pub var: String,
  pub value: String,
  pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
  pub cache_dir: PathBuf,
  pub cache_max_bytes: Option<u64>,
  pub remote_cache: Option<String>,
  pub jobs: Option<usize>,
}

impl Settings {
  pub fn from_env() -> Result<Self, ConfigError> {
    let cache_dir = env_value(ENV_CACHE_DIR).map(PathBuf::from).unwrap_or_else(cache_dir);

    let cache_max_bytes = match env_value(ENV_CACHE_MAX_BYTES) {
      Some(value) => Some(parse_size(&value).map_err(|reason| ConfigError {
        var: ENV_CACHE_MAX_BYTES.to_string(),
        value,
        reason,
      })?),
      None => None,
    };

    let jobs = match env_value(ENV_JOBS) {
      Some(value) => match value.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
          return Err(ConfigError {
            var: ENV_JOBS.to_string(),
            value,
            reason: "expected a positive integer".to_string(),
          });
        }
      },
      None => None,
    };

    let settings = Self {
      cache_dir,
      cache_max_bytes,
      remote_cache: env_value(ENV_REMOTE_CACHE),
      jobs,
    };
    debug!(?settings, "loaded settings");
    Ok(settings)
  }

  /// Execution defaults with the configured job count applied.
  pub fn execute_config(&self) -> ExecuteConfig {
    let mut config = ExecuteConfig::default();
    if let Some(jobs) = self.jobs {
      config.concurrency = jobs;
    }
    config
  }

  /// Open the disk cache at `cache_dir`, with the remote tier if configured.
  pub fn open_cache(&self) -> Result<TieredCache, CacheError> {
    let disk = DiskCache::open(&self.cache_dir, self.cache_max_bytes)?;
    let mut cache = TieredCache::new(Arc::new(disk));
    if let Some(url) = &self.remote_cache {
      cache = cache.with_remote(Arc::new(HttpRemoteCache::new(url)?));
    }
    Ok(cache)
  }
}

/// Non-empty value of an environment variable.
fn env_value(var: &str) -> Option<String> {
  std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a byte count: a plain integer or one with a binary `K`, `M` or `G`
/// suffix (`512M` is 512 MiB).
pub fn parse_size(input: &str) -> Result<u64, String> {
  let trimmed = input.trim();
  let (digits, multiplier) = match trimmed.char_indices().last() {
    Some((idx, c)) if c.is_ascii_alphabetic() => {
      let multiplier = match c.to_ascii_uppercase() {
        'K' => 1u64 << 10,
        'M' => 1 << 20,
        'G' => 1 << 30,
        _ => return Err(format!("unknown size suffix `{}`", c)),
      };
      (&trimmed[..idx], multiplier)
    }
    _ => (trimmed, 1),
  };

  let value: u64 = digits
    .trim()
    .parse()
    .map_err(|_| "expected a byte count such as 1048576 or 512M".to_string())?;
  value
    .checked_mul(multiplier)
    .ok_or_else(|| "size is too large".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  const VARS: [&str; 4] = [ENV_CACHE_DIR, ENV_CACHE_MAX_BYTES, ENV_REMOTE_CACHE, ENV_JOBS];

  fn cleared() -> Vec<(&'static str, Option<&'static str>)> {
    VARS.iter().map(|v| (*v, None)).collect()
  }

  #[test]
  fn parse_size_accepts_suffixes() {
    assert_eq!(parse_size("1024"), Ok(1024));
    assert_eq!(parse_size("4k"), Ok(4096));
    assert_eq!(parse_size("512M"), Ok(512 * 1024 * 1024));
    assert_eq!(parse_size(" 2G "), Ok(2 * 1024 * 1024 * 1024));
    assert!(parse_size("12T").is_err());
    assert!(parse_size("lots").is_err());
    assert!(parse_size("").is_err());
  }

  #[test]
  #[serial]
  fn defaults_without_environment() {
    temp_env::with_vars(cleared(), || {
      let settings = Settings::from_env().unwrap();
      assert_eq!(settings.cache_dir, cache_dir());
      assert_eq!(settings.cache_max_bytes, None);
      assert_eq!(settings.remote_cache, None);
      assert_eq!(settings.jobs, None);
    });
  }

  #[test]
  #[serial]
  fn reads_every_variable() {
    temp_env::with_vars(
      [
        (ENV_CACHE_DIR, Some("/tmp/keel-cache")),
        (ENV_CACHE_MAX_BYTES, Some("64M")),
        (ENV_REMOTE_CACHE, Some("http://cache.internal:8080")),
        (ENV_JOBS, Some("3")),
      ],
      || {
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.cache_dir, PathBuf::from("/tmp/keel-cache"));
        assert_eq!(settings.cache_max_bytes, Some(64 << 20));
        assert_eq!(settings.remote_cache.as_deref(), Some("http://cache.internal:8080"));
        assert_eq!(settings.execute_config().concurrency, 3);
      },
    );
  }

  #[test]
  #[serial]
  fn rejects_bad_values() {
    temp_env::with_vars([(ENV_JOBS, Some("0")), (ENV_CACHE_MAX_BYTES, None)], || {
      let err = Settings::from_env().unwrap_err();
      assert_eq!(err.var, ENV_JOBS);
    });
    temp_env::with_vars([(ENV_JOBS, None), (ENV_CACHE_MAX_BYTES, Some("big"))], || {
      let err = Settings::from_env().unwrap_err();
      assert_eq!(err.var, ENV_CACHE_MAX_BYTES);
    });
  }

  #[test]
  #[serial]
  fn open_cache_creates_disk_tier() {
    let temp = tempfile::TempDir::new().unwrap();
    let settings = Settings {
      cache_dir: temp.path().join("cache"),
      cache_max_bytes: None,
      remote_cache: None,
      jobs: None,
    };
    let cache = settings.open_cache().unwrap();
    assert!(cache.is_enabled());
  }
}
