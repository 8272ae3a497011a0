//! Crate-wide constants.

/// Application name, used for XDG directories and environment variable prefixes.
pub const APP_NAME: &str = "keel";

/// Version of the rule key schema. Bump when the canonical serialization changes
/// so that old cache entries are never matched by new keys.
pub const RULE_KEY_VERSION: u32 = 1;

/// Directory under the output root holding per-action scratch directories.
pub const SCRATCH_DIR: &str = ".scratch";

/// Default output root name, relative to the workspace.
pub const DEFAULT_OUTPUT_DIR: &str = "keel-out";

/// Prefix and suffix of build trace file names (`build.<id>.trace`).
pub const TRACE_FILE_PREFIX: &str = "build.";
pub const TRACE_FILE_SUFFIX: &str = ".trace";

/// Environment variables read by [`crate::config::Settings::from_env`].
pub const ENV_CACHE_DIR: &str = "KEEL_CACHE_DIR";
pub const ENV_CACHE_MAX_BYTES: &str = "KEEL_CACHE_MAX_BYTES";
pub const ENV_REMOTE_CACHE: &str = "KEEL_REMOTE_CACHE";
pub const ENV_JOBS: &str = "KEEL_JOBS";
