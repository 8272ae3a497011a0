//! Shell command transformation.
//!
//! Commands run with an isolated environment so that their outputs depend
//! only on what the action declares.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::action::{ExecContext, Executable, StepError};
use crate::artifact::{Artifact, pack_outputs_async};

/// `PATH` handed to commands that do not set one explicitly.
pub const DEFAULT_PATH: &str = "/usr/bin:/bin";

/// Run a shell command, then pack the declared outputs from `$out`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdStep {
  pub cmd: String,
  pub env: BTreeMap<String, String>,
  /// Working directory relative to the workspace root (defaults to the root).
  pub cwd: Option<String>,
}

impl CmdStep {
  pub fn new(cmd: &str) -> Self {
    Self {
      cmd: cmd.to_string(),
      env: BTreeMap::new(),
      cwd: None,
    }
  }

  pub fn with_env(mut self, key: &str, value: &str) -> Self {
    self.env.insert(key.to_string(), value.to_string());
    self
  }

  pub fn with_cwd(mut self, cwd: &str) -> Self {
    self.cwd = Some(cwd.to_string());
    self
  }
}

#[async_trait]
impl Executable for CmdStep {
  fn type_tag(&self) -> &str {
    "cmd"
  }

  fn key_fields(&self) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert("cmd".to_string(), self.cmd.clone());
    if let Some(cwd) = &self.cwd {
      fields.insert("cwd".to_string(), cwd.clone());
    }
    for (key, value) in &self.env {
      fields.insert(format!("env.{}", key), value.clone());
    }
    fields
  }

  async fn execute(&self, ctx: &ExecContext) -> Result<Artifact, StepError> {
    let cwd = self.cwd.as_deref().map(Path::new);
    execute_cmd(&self.cmd, &self.env, cwd, ctx).await?;
    Ok(pack_outputs_async(&ctx.out_dir, &ctx.outputs).await?)
  }
}

/// Execute a command for an action.
///
/// Runs the command in an isolated environment:
/// - Clears all environment variables
/// - Sets PATH to [`DEFAULT_PATH`] unless the action provides one
/// - Sets HOME to /homeless-shelter
/// - Sets TMPDIR/TMP/TEMP to a temp directory within the output directory
/// - Sets `out` to the output directory and `KEEL_TARGET` to the target name
/// - Merges user-specified environment variables
///
/// The child is killed if the context is cancelled or the returned future is
/// dropped (for example by a timeout).
///
/// Returns the trimmed stdout on success.
pub async fn execute_cmd(
  cmd: &str,
  env: &BTreeMap<String, String>,
  cwd: Option<&Path>,
  ctx: &ExecContext,
) -> Result<String, StepError> {
  info!(action = %ctx.target, cmd = %cmd, "executing command");

  let tmp_dir = ctx.out_dir.join(".tmp");
  tokio::fs::create_dir_all(&tmp_dir).await?;

  let (shell_cmd, shell_args) = get_shell(ctx.shell.as_deref());

  let working_dir = match cwd {
    Some(dir) => ctx.workspace.join(dir),
    None => ctx.workspace.clone(),
  };

  let mut command = Command::new(&shell_cmd);
  command
    .args(&shell_args)
    .arg(cmd)
    .current_dir(&working_dir)
    .env_clear()
    .env("PATH", DEFAULT_PATH)
    .env("HOME", "/homeless-shelter")
    .env("TMPDIR", &tmp_dir)
    .env("TMP", &tmp_dir)
    .env("TEMP", &tmp_dir)
    .env("out", &ctx.out_dir)
    .env("KEEL_TARGET", ctx.target.to_string())
    .env("LANG", "C")
    .env("LC_ALL", "C")
    // 1980-01-01T00:00:00Z, the ZIP epoch
    .env("SOURCE_DATE_EPOCH", "315532800")
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  for (key, value) in env {
    command.env(key, value);
  }

  debug!(shell = %shell_cmd, working_dir = ?working_dir, "spawning process");

  let child = command.spawn()?;

  let output = tokio::select! {
    output = child.wait_with_output() => output?,
    _ = ctx.cancel.cancelled() => {
      debug!(action = %ctx.target, "command cancelled");
      return Err(StepError::Cancelled);
    }
  };

  if let Err(e) = tokio::fs::remove_dir_all(&tmp_dir).await {
    debug!(path = ?tmp_dir, error = %e, "failed to remove command temp dir");
  }

  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
      debug!(stderr = %stderr, "command stderr");
    }

    return Err(StepError::CmdFailed {
      cmd: cmd.to_string(),
      code: output.status.code(),
    });
  }

  let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

  if !stdout.is_empty() {
    debug!(stdout = %stdout, "command output");
  }

  Ok(stdout)
}

/// Get the shell command and arguments.
///
/// Defaults to `/bin/sh -c` rather than `$SHELL`, since interactive shells may
/// source profile files that modify the environment.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    (
      "powershell.exe".to_string(),
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ],
    )
  }
}
