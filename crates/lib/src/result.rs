//! Build result aggregation.
//!
//! The scheduler reports every state transition as a [`BuildEvent`] over an
//! unbounded channel. A dedicated [`Aggregator`] task folds the events into a
//! [`BuildResult`], which is frozen once the channel closes. Presentation
//! layers (the CLI summary, trace files) only ever see the frozen result or
//! the event stream, never scheduler state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::action::Target;
use crate::execute::{ExecuteError, ExecutionState, FailureCause, SkipReason};
use crate::rulekey::Fingerprint;

/// Callback invoked by the aggregator for every event, in order.
pub type EventObserver = Arc<dyn Fn(&BuildEvent) + Send + Sync>;

/// A state transition reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
  pub target: Target,
  pub state: ExecutionState,
  pub fingerprint: Option<Fingerprint>,
  pub cause: Option<FailureCause>,
  pub skip: Option<SkipReason>,
  /// Time since the build started.
  pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
  Started {
    build_id: String,
    started_at_unix_ms: u64,
    total: usize,
  },
  StateChanged(StateChange),
  Finished {
    wall_time: Duration,
  },
}

/// When an action ran, relative to the build start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActionTiming {
  pub start_us: u64,
  pub duration_us: u64,
}

impl ActionTiming {
  pub fn duration(&self) -> Duration {
    Duration::from_micros(self.duration_us)
  }
}

/// Final outcome of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
  pub state: ExecutionState,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub fingerprint: Option<Fingerprint>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cause: Option<FailureCause>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub skipped_because: Option<SkipReason>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timing: Option<ActionTiming>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
  pub target: Target,
  pub cause: FailureCause,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
  pub total: usize,
  pub built: usize,
  pub cache_hit: usize,
  pub failed: usize,
  pub skipped: usize,
}

/// Frozen summary of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildResult {
  pub build_id: String,
  pub started_at_unix_ms: u64,
  pub wall_time_ms: u64,
  pub counts: OutcomeCounts,
  pub outcomes: BTreeMap<Target, ActionOutcome>,
  /// Failures in the order they happened.
  pub failures: Vec<FailureRecord>,
}

impl BuildResult {
  /// True when every action was built or served from the cache.
  pub fn is_success(&self) -> bool {
    self.counts.failed == 0 && self.counts.skipped == 0 && self.counts.built + self.counts.cache_hit == self.counts.total
  }

  pub fn wall_time(&self) -> Duration {
    Duration::from_millis(self.wall_time_ms)
  }

  pub fn outcome(&self, target: &Target) -> Option<&ActionOutcome> {
    self.outcomes.get(target)
  }

  pub fn state(&self, target: &Target) -> Option<ExecutionState> {
    self.outcomes.get(target).map(|o| o.state)
  }

  /// Final state per target, ignoring timing.
  pub fn outcome_set(&self) -> BTreeMap<Target, ExecutionState> {
    self.outcomes.iter().map(|(t, o)| (t.clone(), o.state)).collect()
  }

  /// Skipped targets and the reason for each, sorted by target.
  pub fn skipped(&self) -> impl Iterator<Item = (&Target, &SkipReason)> {
    self
      .outcomes
      .iter()
      .filter_map(|(t, o)| o.skipped_because.as_ref().map(|reason| (t, reason)))
  }

  /// Human-readable summary: every failure with its cause, every skipped
  /// action with the upstream failure behind it, then the counts.
  pub fn summary_lines(&self) -> Vec<String> {
    let mut lines = Vec::new();
    for failure in &self.failures {
      lines.push(format!("FAILED {}: {}", failure.target, failure.cause));
    }
    for (target, reason) in self.skipped() {
      lines.push(format!("SKIPPED {}: {}", target, reason));
    }
    let c = &self.counts;
    lines.push(format!(
      "{} actions: {} built, {} cached, {} failed, {} skipped in {:.2}s",
      c.total,
      c.built,
      c.cache_hit,
      c.failed,
      c.skipped,
      self.wall_time().as_secs_f64()
    ));
    lines
  }
}

/// Folds events into a result. Kept separate from the task for testing.
#[derive(Debug, Default)]
struct Accumulator {
  build_id: String,
  started_at_unix_ms: u64,
  total: usize,
  wall_time: Duration,
  outcomes: BTreeMap<Target, ActionOutcome>,
  failures: Vec<FailureRecord>,
  running_since: HashMap<Target, Duration>,
}

impl Accumulator {
  fn apply(&mut self, event: &BuildEvent) {
    match event {
      BuildEvent::Started {
        build_id,
        started_at_unix_ms,
        total,
      } => {
        self.build_id = build_id.clone();
        self.started_at_unix_ms = *started_at_unix_ms;
        self.total = *total;
      }
      BuildEvent::StateChanged(change) => self.apply_change(change),
      BuildEvent::Finished { wall_time } => self.wall_time = *wall_time,
    }
  }

  fn apply_change(&mut self, change: &StateChange) {
    if change.state == ExecutionState::Running {
      self.running_since.insert(change.target.clone(), change.elapsed);
    }

    let timing = if change.state.is_terminal() {
      self.running_since.remove(&change.target).map(|start| ActionTiming {
        start_us: start.as_micros() as u64,
        duration_us: change.elapsed.saturating_sub(start).as_micros() as u64,
      })
    } else {
      None
    };

    if change.state == ExecutionState::Failed
      && let Some(cause) = &change.cause
    {
      self.failures.push(FailureRecord {
        target: change.target.clone(),
        cause: cause.clone(),
      });
    }

    let outcome = self.outcomes.entry(change.target.clone()).or_insert(ActionOutcome {
      state: change.state,
      fingerprint: None,
      cause: None,
      skipped_because: None,
      timing: None,
    });
    outcome.state = change.state;
    if change.fingerprint.is_some() {
      outcome.fingerprint = change.fingerprint;
    }
    if change.cause.is_some() {
      outcome.cause = change.cause.clone();
    }
    if change.skip.is_some() {
      outcome.skipped_because = change.skip.clone();
    }
    if timing.is_some() {
      outcome.timing = timing;
    }
  }

  fn freeze(self) -> BuildResult {
    let mut counts = OutcomeCounts {
      total: self.total.max(self.outcomes.len()),
      ..OutcomeCounts::default()
    };
    for outcome in self.outcomes.values() {
      match outcome.state {
        ExecutionState::Built => counts.built += 1,
        ExecutionState::CacheHit => counts.cache_hit += 1,
        ExecutionState::Failed => counts.failed += 1,
        ExecutionState::Skipped => counts.skipped += 1,
        _ => {}
      }
    }

    BuildResult {
      build_id: self.build_id,
      started_at_unix_ms: self.started_at_unix_ms,
      wall_time_ms: self.wall_time.as_millis() as u64,
      counts,
      outcomes: self.outcomes,
      failures: self.failures,
    }
  }
}

/// Background task collecting build events.
pub struct Aggregator {
  tx: UnboundedSender<BuildEvent>,
  handle: JoinHandle<BuildResult>,
}

impl Aggregator {
  /// Spawn the aggregator on the current runtime.
  pub fn spawn(observer: Option<EventObserver>) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel::<BuildEvent>();

    let handle = tokio::spawn(async move {
      let mut acc = Accumulator::default();
      while let Some(event) = rx.recv().await {
        if let Some(observer) = &observer {
          observer(&event);
        }
        acc.apply(&event);
      }
      debug!(actions = acc.outcomes.len(), "aggregator drained");
      acc.freeze()
    });

    Self { tx, handle }
  }

  pub fn sender(&self) -> UnboundedSender<BuildEvent> {
    self.tx.clone()
  }

  /// Close the channel and wait for the frozen result. Every sender must
  /// have been dropped, or this waits for them.
  pub async fn finish(self) -> Result<BuildResult, ExecuteError> {
    drop(self.tx);
    self.handle.await.map_err(|_| ExecuteError::AggregatorClosed)
  }
}
