//! Per-user directories, following the XDG base directory layout on Unix and
//! the known folders on Windows.

use std::path::PathBuf;

use crate::consts::APP_NAME;

/// Returns the user's home directory, if the environment names one.
#[cfg(windows)]
pub fn home_dir() -> Option<PathBuf> {
  std::env::var_os("USERPROFILE").map(PathBuf::from)
}

/// Returns the user's home directory, if the environment names one.
#[cfg(not(windows))]
pub fn home_dir() -> Option<PathBuf> {
  std::env::var_os("HOME").filter(|h| !h.is_empty()).map(PathBuf::from)
}

/// Returns the directory for cache files for the application.
///
/// Falls back to the system temp directory when no home is known.
#[cfg(windows)]
pub fn cache_dir() -> PathBuf {
  match std::env::var_os("LOCALAPPDATA") {
    Some(local) => PathBuf::from(local).join(APP_NAME).join("Cache"),
    None => std::env::temp_dir().join(APP_NAME).join("Cache"),
  }
}

/// Returns the directory for cache files for the application.
///
/// Falls back to the system temp directory when no home is known.
#[cfg(not(windows))]
pub fn cache_dir() -> PathBuf {
  xdg_dir("XDG_CACHE_HOME", &[".cache"])
}

/// Returns the directory for data files for the application.
#[cfg(windows)]
pub fn data_dir() -> PathBuf {
  match std::env::var_os("APPDATA") {
    Some(appdata) => PathBuf::from(appdata).join(APP_NAME),
    None => std::env::temp_dir().join(APP_NAME),
  }
}

/// Returns the directory for data files for the application.
#[cfg(not(windows))]
pub fn data_dir() -> PathBuf {
  xdg_dir("XDG_DATA_HOME", &[".local", "share"])
}

/// Where build traces are written unless overridden.
pub fn traces_dir() -> PathBuf {
  data_dir().join("traces")
}

#[cfg(not(windows))]
fn xdg_dir(var: &str, fallback: &[&str]) -> PathBuf {
  let base = match std::env::var_os(var).filter(|v| !v.is_empty()) {
    Some(dir) => PathBuf::from(dir),
    None => match home_dir() {
      Some(home) => fallback.iter().fold(home, |path, segment| path.join(segment)),
      None => std::env::temp_dir(),
    },
  };
  base.join(APP_NAME)
}
