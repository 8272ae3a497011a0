//! Test utilities for keel-lib.
//!
//! [`ScriptedStep`] is a transformation whose behavior is chosen by the test
//! and which records every invocation in a shared [`Journal`], so scheduler
//! tests can assert what ran, in what order, and how often.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::action::{Action, ExecContext, Executable, StepError, Target};
use crate::artifact::{Artifact, pack_outputs};

#[derive(Debug, Clone)]
pub enum Behavior {
  /// Write the target name to every declared output.
  Succeed,
  Fail(String),
  /// Sleep (ignoring cancellation) before succeeding.
  Sleep(Duration),
  /// Wait for cancellation and report it.
  WaitForCancel,
  Panic,
}

/// Shared record of step invocations.
#[derive(Debug, Default)]
pub struct Journal {
  order: Mutex<Vec<Target>>,
  active: AtomicUsize,
  max_active: AtomicUsize,
}

impl Journal {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Targets in the order their steps started.
  pub fn order(&self) -> Vec<Target> {
    self.order.lock().unwrap().clone()
  }

  pub fn calls(&self, target: &Target) -> usize {
    self.order.lock().unwrap().iter().filter(|t| *t == target).count()
  }

  pub fn total_calls(&self) -> usize {
    self.order.lock().unwrap().len()
  }

  /// Highest number of steps observed running at once.
  pub fn max_active(&self) -> usize {
    self.max_active.load(Ordering::SeqCst)
  }
}

#[derive(Debug)]
pub struct ScriptedStep {
  behavior: Behavior,
  journal: Arc<Journal>,
}

impl ScriptedStep {
  pub fn new(behavior: Behavior, journal: &Arc<Journal>) -> Self {
    Self {
      behavior,
      journal: Arc::clone(journal),
    }
  }
}

#[async_trait]
impl Executable for ScriptedStep {
  fn type_tag(&self) -> &str {
    "scripted"
  }

  fn key_fields(&self) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert("behavior".to_string(), format!("{:?}", self.behavior));
    fields
  }

  async fn execute(&self, ctx: &ExecContext) -> Result<Artifact, StepError> {
    self.journal.order.lock().unwrap().push(ctx.target.clone());
    let active = self.journal.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.journal.max_active.fetch_max(active, Ordering::SeqCst);

    let result = match &self.behavior {
      Behavior::Succeed => write_outputs(ctx),
      Behavior::Fail(message) => Err(StepError::Failed(message.clone())),
      Behavior::Sleep(duration) => {
        tokio::time::sleep(*duration).await;
        write_outputs(ctx)
      }
      Behavior::WaitForCancel => {
        ctx.cancel.cancelled().await;
        Err(StepError::Cancelled)
      }
      Behavior::Panic => panic!("scripted panic in {}", ctx.target),
    };

    self.journal.active.fetch_sub(1, Ordering::SeqCst);
    result
  }
}

fn write_outputs(ctx: &ExecContext) -> Result<Artifact, StepError> {
  for output in &ctx.outputs {
    let path = ctx.out_dir.join(output);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, ctx.target.to_string())?;
  }
  Ok(pack_outputs(&ctx.out_dir, &ctx.outputs)?)
}

/// Parse a target, panicking on malformed test input.
pub fn target(s: &str) -> Target {
  Target::parse(s).unwrap()
}

/// Build an action running a scripted step with one declared output.
pub fn scripted(name: &str, deps: &[&str], behavior: Behavior, journal: &Arc<Journal>) -> Action {
  Action::new(target(name), Arc::new(ScriptedStep::new(behavior, journal)))
    .with_deps(deps.iter().map(|d| target(d)))
    .with_outputs(["out.txt".to_string()])
}
