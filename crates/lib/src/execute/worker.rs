//! A single action's trip through the cache and its transformation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::types::FailureCause;
use crate::action::{Action, Cacheable, ExecContext, Fingerprintable, Identifiable, StepError};
use crate::artifact::{Artifact, materialize_async};
use crate::cache::{CacheError, TieredCache};
use crate::rulekey::{self, Fingerprint};

/// Everything a worker needs, owned so it can move onto a task.
pub(crate) struct Job {
  pub action: Arc<Action>,
  pub dep_fingerprints: Vec<Fingerprint>,
  pub workspace: PathBuf,
  pub output_dir: PathBuf,
  pub scratch_root: PathBuf,
  pub cache: TieredCache,
  pub cancel: CancellationToken,
  pub timeout: Option<Duration>,
  pub shell: Option<String>,
}

#[derive(Debug)]
pub(crate) enum WorkerOutcome {
  CacheHit,
  Built,
  Failed(FailureCause),
  /// The cache is unusable; the run must stop.
  Fatal(CacheError),
}

#[derive(Debug)]
pub(crate) struct WorkerReport {
  pub fingerprint: Option<Fingerprint>,
  pub outcome: WorkerOutcome,
}

fn failed(fingerprint: Option<Fingerprint>, message: impl ToString) -> WorkerReport {
  WorkerReport {
    fingerprint,
    outcome: WorkerOutcome::Failed(FailureCause::ActionExecution {
      message: message.to_string(),
    }),
  }
}

pub(crate) async fn run_job(job: Job) -> WorkerReport {
  let target = job.action.target().clone();

  let fingerprint = match compute_fingerprint(&job).await {
    Ok(fp) => fp,
    Err(message) => return failed(None, message),
  };
  let fp = Some(fingerprint);

  if job.action.is_cacheable() {
    match job.cache.lookup(&fingerprint).await {
      Ok(Some(entry)) => {
        if let Err(e) = materialize_async(entry.artifact, &job.output_dir).await {
          return failed(fp, e);
        }
        info!(action = %target, fingerprint = %fingerprint, "cache hit");
        return WorkerReport {
          fingerprint: fp,
          outcome: WorkerOutcome::CacheHit,
        };
      }
      Ok(None) => debug!(action = %target, fingerprint = %fingerprint, "cache miss"),
      Err(e) => {
        return WorkerReport {
          fingerprint: fp,
          outcome: WorkerOutcome::Fatal(e),
        };
      }
    }
  }

  let artifact = match execute_step(&job).await {
    Ok(artifact) => artifact,
    Err(cause) => {
      return WorkerReport {
        fingerprint: fp,
        outcome: WorkerOutcome::Failed(cause),
      };
    }
  };

  if job.action.is_cacheable()
    && let Err(e) = job.cache.publish(&fingerprint, &artifact).await
  {
    return WorkerReport {
      fingerprint: fp,
      outcome: WorkerOutcome::Fatal(e),
    };
  }

  let size = artifact.len();
  if let Err(e) = materialize_async(artifact, &job.output_dir).await {
    return failed(fp, e);
  }

  info!(action = %target, fingerprint = %fingerprint, size, "built");
  WorkerReport {
    fingerprint: fp,
    outcome: WorkerOutcome::Built,
  }
}

/// Hash the action's declared inputs on the blocking pool.
async fn compute_fingerprint(job: &Job) -> Result<Fingerprint, String> {
  let action = Arc::clone(&job.action);
  let deps = job.dep_fingerprints.clone();
  let workspace = job.workspace.clone();
  tokio::task::spawn_blocking(move || rulekey::fingerprint(&action, &deps, &workspace))
    .await
    .map_err(|e| e.to_string())?
    .map_err(|e| e.to_string())
}

/// Run the transformation in a fresh scratch directory, under the timeout.
async fn execute_step(job: &Job) -> Result<Artifact, FailureCause> {
  let execution_error = |message: String| FailureCause::ActionExecution { message };

  tokio::fs::create_dir_all(&job.scratch_root)
    .await
    .map_err(|e| execution_error(e.to_string()))?;
  let scratch = tempfile::Builder::new()
    .prefix(&job.action.target().name().replace('/', "_"))
    .tempdir_in(&job.scratch_root)
    .map_err(|e| execution_error(e.to_string()))?;

  let ctx = ExecContext {
    target: job.action.target().clone(),
    workspace: job.workspace.clone(),
    out_dir: scratch.path().to_path_buf(),
    outputs: job.action.declared_outputs().to_vec(),
    cancel: job.cancel.clone(),
    shell: job.shell.clone(),
  };

  let step = job.action.step();
  let result = match job.timeout {
    Some(limit) => match tokio::time::timeout(limit, step.execute(&ctx)).await {
      Ok(result) => result,
      Err(_) => {
        return Err(FailureCause::Timeout {
          limit_ms: limit.as_millis() as u64,
        });
      }
    },
    None => step.execute(&ctx).await,
  };

  match result {
    Ok(artifact) => Ok(artifact),
    Err(StepError::Cancelled) => Err(FailureCause::Cancelled),
    Err(e) => Err(execution_error(e.to_string())),
  }
}
