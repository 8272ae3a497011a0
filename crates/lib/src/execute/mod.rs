//! Scheduling and executing an action graph.
//!
//! A single coordinator owns every action's [`ExecutionState`] and the ready
//! set. Workers run on a `JoinSet` and hand their outcome back to the
//! coordinator, so no worker touches shared scheduling state. At most
//! `concurrency` workers are in flight; among ready actions the one with the
//! most transitive dependents is dispatched first.
//!
//! A failed action marks every transitive dependent `Skipped`. Independent
//! branches keep going unless fail-fast is configured. Cancellation stops
//! dispatch at once, gives running steps a grace period to notice, then
//! abandons whatever is left.

mod context;
mod ready;
mod types;
mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::action::{Identifiable, Target};
use crate::graph::ActionGraph;
use crate::result::{Aggregator, BuildEvent, BuildResult, StateChange};
use crate::rulekey::Fingerprint;

pub use context::BuildContext;
pub use types::*;

use ready::ReadyQueue;
use worker::{Job, WorkerOutcome, WorkerReport, run_job};

static BUILD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Build every action in `graph`.
///
/// Per-action failures, timeouts and cancellation are recorded in the
/// returned [`BuildResult`]. Only infrastructure failures (an unusable cache,
/// an output root that cannot be created) return an error.
pub async fn run(graph: &ActionGraph, ctx: &BuildContext, config: &ExecuteConfig) -> Result<BuildResult, ExecuteError> {
  let aggregator = Aggregator::spawn(ctx.observer.clone());
  let scheduler = Scheduler::new(graph, ctx, config, aggregator.sender());
  scheduler.run().await?;
  aggregator.finish().await
}

struct Scheduler<'a> {
  graph: &'a ActionGraph,
  ctx: &'a BuildContext,
  config: &'a ExecuteConfig,
  events: UnboundedSender<BuildEvent>,
  start: Instant,
  states: HashMap<Target, ExecutionState>,
  /// Unresolved dependency count per action.
  remaining: HashMap<Target, usize>,
  order: HashMap<Target, usize>,
  priority: HashMap<Target, usize>,
  fingerprints: HashMap<Target, Fingerprint>,
  ready: ReadyQueue,
  running: HashMap<Id, Target>,
  workers: JoinSet<WorkerReport>,
  first_failure: Option<Target>,
  cancel_deadline: Option<tokio::time::Instant>,
}

impl<'a> Scheduler<'a> {
  fn new(
    graph: &'a ActionGraph,
    ctx: &'a BuildContext,
    config: &'a ExecuteConfig,
    events: UnboundedSender<BuildEvent>,
  ) -> Self {
    Self {
      graph,
      ctx,
      config,
      events,
      start: Instant::now(),
      states: HashMap::with_capacity(graph.len()),
      remaining: HashMap::with_capacity(graph.len()),
      order: HashMap::with_capacity(graph.len()),
      priority: graph.transitive_dependent_counts(),
      fingerprints: HashMap::with_capacity(graph.len()),
      ready: ReadyQueue::default(),
      running: HashMap::new(),
      workers: JoinSet::new(),
      first_failure: None,
      cancel_deadline: None,
    }
  }

  async fn run(mut self) -> Result<(), ExecuteError> {
    let (build_id, started_at_unix_ms) = new_build_id();
    let concurrency = self.config.concurrency.max(1);
    info!(
      build_id = %build_id,
      actions = self.graph.len(),
      concurrency,
      fail_fast = self.config.fail_fast,
      "starting build"
    );
    self.emit(BuildEvent::Started {
      build_id,
      started_at_unix_ms,
      total: self.graph.len(),
    });

    let scratch = self.ctx.scratch_root();
    std::fs::create_dir_all(&scratch).map_err(|e| ExecuteError::Io {
      path: scratch.display().to_string(),
      source: e,
    })?;

    let mut roots = Vec::new();
    for (idx, action) in self.graph.iter().enumerate() {
      let target = action.target().clone();
      self.order.insert(target.clone(), idx);
      self.remaining.insert(target.clone(), action.deps().len());
      self.states.insert(target.clone(), ExecutionState::Pending);
      if action.deps().is_empty() {
        roots.push(target);
      }
    }
    for target in roots {
      self.mark_ready(target);
    }

    let cancel = self.ctx.cancel.clone();
    loop {
      if cancel.is_cancelled() {
        self.begin_cancel();
      }

      if self.may_dispatch() {
        while self.workers.len() < concurrency {
          let Some(target) = self.ready.pop() else {
            break;
          };
          self.dispatch(target);
        }
      }

      if self.workers.is_empty() {
        break;
      }

      let deadline = self.cancel_deadline;
      tokio::select! {
        joined = self.workers.join_next_with_id() => {
          if let Some(joined) = joined {
            self.complete(joined)?;
          }
        }
        _ = cancel.cancelled(), if deadline.is_none() => self.begin_cancel(),
        _ = sleep_until(deadline) => {
          self.abandon_workers().await?;
          break;
        }
      }
    }

    self.skip_leftovers(cancel.is_cancelled());

    let wall_time = self.start.elapsed();
    self.emit(BuildEvent::Finished { wall_time });
    info!(
      wall_time_ms = wall_time.as_millis() as u64,
      failed = self.count(ExecutionState::Failed),
      skipped = self.count(ExecutionState::Skipped),
      "build finished"
    );
    Ok(())
  }

  fn may_dispatch(&self) -> bool {
    self.cancel_deadline.is_none() && !(self.config.fail_fast && self.first_failure.is_some())
  }

  fn count(&self, state: ExecutionState) -> usize {
    self.states.values().filter(|s| **s == state).count()
  }

  fn emit(&self, event: BuildEvent) {
    if self.events.send(event).is_err() {
      debug!("aggregator closed, dropping build event");
    }
  }

  fn transition(
    &mut self,
    target: &Target,
    state: ExecutionState,
    fingerprint: Option<Fingerprint>,
    cause: Option<FailureCause>,
    skip: Option<SkipReason>,
  ) {
    self.states.insert(target.clone(), state);
    self.emit(BuildEvent::StateChanged(StateChange {
      target: target.clone(),
      state,
      fingerprint,
      cause,
      skip,
      elapsed: self.start.elapsed(),
    }));
  }

  fn mark_ready(&mut self, target: Target) {
    self.transition(&target, ExecutionState::Ready, None, None, None);
    let dependents = self.priority.get(&target).copied().unwrap_or(0);
    let order = self.order.get(&target).copied().unwrap_or(usize::MAX);
    self.ready.push(target, dependents, order);
  }

  fn dispatch(&mut self, target: Target) {
    let Some(action) = self.graph.get(&target).map(Arc::clone) else {
      return;
    };

    // Every dependency succeeded, so each has a fingerprint.
    let dep_fingerprints: Vec<Fingerprint> = action
      .deps()
      .iter()
      .filter_map(|dep| self.fingerprints.get(dep).copied())
      .collect();

    let job = Job {
      dep_fingerprints,
      workspace: self.ctx.workspace.clone(),
      output_dir: self.ctx.output_dir(&target),
      scratch_root: self.ctx.scratch_root(),
      cache: self.ctx.cache.clone(),
      cancel: self.ctx.cancel.child_token(),
      timeout: action.timeout().or(self.config.action_timeout),
      shell: self.config.shell.clone(),
      action,
    };

    self.transition(&target, ExecutionState::Running, None, None, None);
    debug!(action = %target, "dispatching action");
    let handle = self.workers.spawn(run_job(job));
    self.running.insert(handle.id(), target);
  }

  fn complete(&mut self, joined: Result<(Id, WorkerReport), JoinError>) -> Result<(), ExecuteError> {
    let (id, report) = match joined {
      Ok(pair) => pair,
      Err(e) => {
        let Some(target) = self.running.remove(&e.id()) else {
          return Ok(());
        };
        let cause = if e.is_panic() {
          FailureCause::ActionExecution {
            message: panic_message(e),
          }
        } else {
          FailureCause::Cancelled
        };
        self.fail(target, None, cause);
        return Ok(());
      }
    };

    let Some(target) = self.running.remove(&id) else {
      return Ok(());
    };
    let fingerprint = report.fingerprint;
    if let Some(fp) = fingerprint {
      self.fingerprints.insert(target.clone(), fp);
    }

    match report.outcome {
      WorkerOutcome::CacheHit => {
        self.transition(&target, ExecutionState::CacheHit, fingerprint, None, None);
        self.release_dependents(&target);
      }
      WorkerOutcome::Built => {
        self.transition(&target, ExecutionState::Built, fingerprint, None, None);
        self.release_dependents(&target);
      }
      WorkerOutcome::Failed(cause) => self.fail(target, fingerprint, cause),
      WorkerOutcome::Fatal(e) => {
        error!(action = %target, error = %e, "cache is unusable, aborting build");
        self.workers.abort_all();
        return Err(ExecuteError::Cache(e));
      }
    }
    Ok(())
  }

  fn release_dependents(&mut self, target: &Target) {
    for dependent in self.graph.dependents(target) {
      let Some(remaining) = self.remaining.get_mut(&dependent) else {
        continue;
      };
      *remaining = remaining.saturating_sub(1);
      if *remaining == 0 && self.states.get(&dependent) == Some(&ExecutionState::Pending) {
        self.mark_ready(dependent);
      }
    }
  }

  /// Mark an action failed and skip everything downstream of it.
  fn fail(&mut self, target: Target, fingerprint: Option<Fingerprint>, cause: FailureCause) {
    error!(action = %target, cause = %cause, "action failed");
    self.transition(&target, ExecutionState::Failed, fingerprint, Some(cause), None);
    if self.first_failure.is_none() {
      self.first_failure = Some(target.clone());
    }

    let mut queue: VecDeque<Target> = self.graph.dependents(&target).into();
    while let Some(dependent) = queue.pop_front() {
      if self.states.get(&dependent).is_some_and(|s| s.is_terminal()) {
        continue;
      }
      warn!(action = %dependent, upstream = %target, "skipping action, dependency failed");
      self.transition(
        &dependent,
        ExecutionState::Skipped,
        None,
        None,
        Some(SkipReason::UpstreamFailed(target.clone())),
      );
      queue.extend(self.graph.dependents(&dependent));
    }
  }

  fn begin_cancel(&mut self) {
    if self.cancel_deadline.is_some() {
      return;
    }
    warn!(
      in_flight = self.workers.len(),
      grace_ms = self.config.cancel_grace.as_millis() as u64,
      "build cancelled, no new actions will start"
    );
    self.cancel_deadline = Some(tokio::time::Instant::now() + self.config.cancel_grace);
  }

  /// The grace period is over: stop waiting for cooperative cancellation.
  async fn abandon_workers(&mut self) -> Result<(), ExecuteError> {
    warn!(in_flight = self.workers.len(), "cancellation grace period elapsed, abandoning running actions");
    self.workers.abort_all();
    while let Some(joined) = self.workers.join_next_with_id().await {
      self.complete(joined)?;
    }
    Ok(())
  }

  /// Skip everything never dispatched because dispatch stopped early.
  fn skip_leftovers(&mut self, cancelled: bool) {
    let reason = match (&self.first_failure, cancelled) {
      (_, true) => SkipReason::Cancelled,
      (Some(first), false) => SkipReason::FailFast(first.clone()),
      (None, false) => return,
    };

    self.ready.clear();
    let leftovers: Vec<Target> = self
      .graph
      .iter()
      .map(|action| action.target())
      .filter(|t| self.states.get(*t).is_some_and(|s| !s.is_terminal()))
      .cloned()
      .collect();

    for target in leftovers {
      debug!(action = %target, reason = %reason, "skipping undispatched action");
      self.transition(&target, ExecutionState::Skipped, None, None, Some(reason.clone()));
    }
  }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
  match deadline {
    Some(deadline) => tokio::time::sleep_until(deadline).await,
    None => std::future::pending().await,
  }
}

fn panic_message(e: JoinError) -> String {
  let payload = e.into_panic();
  let message = payload
    .downcast_ref::<String>()
    .cloned()
    .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
    .unwrap_or_else(|| "unknown panic".to_string());
  format!("worker panicked: {}", message)
}

/// Unique build id: start time in milliseconds, process id and a sequence
/// number. Returns the id and the start time.
fn new_build_id() -> (String, u64) {
  let started_at_unix_ms = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0);
  let seq = BUILD_SEQ.fetch_add(1, Ordering::Relaxed);
  (
    format!("{}-{}-{}", started_at_unix_ms, std::process::id(), seq),
    started_at_unix_ms,
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::action::{Action, CachePolicy};
  use crate::artifact::Artifact;
  use crate::cache::{ArtifactMeta, CacheEntry, CacheError, CacheTier, MemoryCache, TieredCache};
  use crate::rulekey;
  use crate::util::testutil::{Behavior, Journal, scripted, target};
  use async_trait::async_trait;
  use std::collections::BTreeMap;
  use std::path::PathBuf;
  use std::time::Duration;
  use tempfile::TempDir;
  use tokio_util::sync::CancellationToken;

  fn config(concurrency: usize) -> ExecuteConfig {
    ExecuteConfig {
      concurrency,
      cancel_grace: Duration::from_secs(5),
      ..ExecuteConfig::default()
    }
  }

  fn context(temp: &TempDir) -> BuildContext {
    BuildContext::new(temp.path())
  }

  fn diamond(a: Behavior, journal: &Arc<Journal>) -> ActionGraph {
    ActionGraph::build(vec![
      scripted("//a:a", &[], a, journal),
      scripted("//b:b", &["//a:a"], Behavior::Succeed, journal),
      scripted("//c:c", &["//a:a"], Behavior::Succeed, journal),
      scripted("//d:d", &["//b:b", "//c:c"], Behavior::Succeed, journal),
    ])
    .unwrap()
  }

  fn states(result: &BuildResult) -> BTreeMap<String, ExecutionState> {
    result
      .outcome_set()
      .into_iter()
      .map(|(t, s)| (t.to_string(), s))
      .collect()
  }

  #[tokio::test]
  async fn empty_graph_succeeds() {
    let temp = TempDir::new().unwrap();
    let graph = ActionGraph::build(Vec::new()).unwrap();
    let result = run(&graph, &context(&temp), &config(4)).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.counts.total, 0);
  }

  #[tokio::test]
  async fn diamond_builds_in_dependency_order() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let ctx = context(&temp);
    let result = run(&diamond(Behavior::Succeed, &journal), &ctx, &config(4)).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.counts.built, 4);
    let order = journal.order();
    assert_eq!(order.first(), Some(&target("//a:a")));
    assert_eq!(order.last(), Some(&target("//d:d")));
    assert_eq!(journal.total_calls(), 4, "every action runs exactly once");

    let out = ctx.output_dir(&target("//d:d")).join("out.txt");
    assert_eq!(std::fs::read_to_string(out).unwrap(), "//d:d");
  }

  #[tokio::test]
  async fn failure_skips_all_dependents() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let graph = diamond(Behavior::Fail("boom".to_string()), &journal);
    let result = run(&graph, &context(&temp), &config(4)).await.unwrap();

    let expected: BTreeMap<String, ExecutionState> = [
      ("//a:a", ExecutionState::Failed),
      ("//b:b", ExecutionState::Skipped),
      ("//c:c", ExecutionState::Skipped),
      ("//d:d", ExecutionState::Skipped),
    ]
    .into_iter()
    .map(|(t, s)| (t.to_string(), s))
    .collect();
    assert_eq!(states(&result), expected);
    assert_eq!(journal.total_calls(), 1);

    for (_, reason) in result.skipped() {
      assert_eq!(reason, &SkipReason::UpstreamFailed(target("//a:a")));
    }
    assert_eq!(result.failures.len(), 1);
    assert_eq!(
      result.failures[0].cause,
      FailureCause::ActionExecution {
        message: "boom".to_string()
      }
    );
  }

  #[tokio::test]
  async fn independent_branches_continue_after_failure() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let graph = ActionGraph::build(vec![
      scripted("//bad:bad", &[], Behavior::Fail("no".to_string()), &journal),
      scripted("//bad:child", &["//bad:bad"], Behavior::Succeed, &journal),
      scripted("//ok:ok", &[], Behavior::Succeed, &journal),
      scripted("//ok:child", &["//ok:ok"], Behavior::Succeed, &journal),
    ])
    .unwrap();

    let result = run(&graph, &context(&temp), &config(1)).await.unwrap();
    assert_eq!(result.state(&target("//ok:child")), Some(ExecutionState::Built));
    assert_eq!(result.state(&target("//bad:child")), Some(ExecutionState::Skipped));
    assert!(!result.is_success());
  }

  #[tokio::test]
  async fn fail_fast_stops_new_dispatch() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let graph = ActionGraph::build(vec![
      scripted("//x:x", &[], Behavior::Succeed, &journal),
      scripted("//y:y", &[], Behavior::Succeed, &journal),
      scripted("//a:a", &[], Behavior::Fail("first".to_string()), &journal),
      scripted("//b:b", &["//a:a"], Behavior::Succeed, &journal),
    ])
    .unwrap();

    let cfg = ExecuteConfig {
      fail_fast: true,
      ..config(1)
    };
    let result = run(&graph, &context(&temp), &cfg).await.unwrap();

    assert_eq!(journal.order(), vec![target("//a:a")], "the hub is dispatched first");
    assert_eq!(
      result.outcome(&target("//b:b")).unwrap().skipped_because,
      Some(SkipReason::UpstreamFailed(target("//a:a")))
    );
    for leftover in ["//x:x", "//y:y"] {
      assert_eq!(
        result.outcome(&target(leftover)).unwrap().skipped_because,
        Some(SkipReason::FailFast(target("//a:a")))
      );
    }
  }

  #[tokio::test]
  async fn fail_fast_lets_in_flight_actions_finish() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let graph = ActionGraph::build(vec![
      scripted("//slow:slow", &[], Behavior::Sleep(Duration::from_millis(200)), &journal),
      scripted("//bad:bad", &[], Behavior::Fail("x".to_string()), &journal),
    ])
    .unwrap();

    let cfg = ExecuteConfig {
      fail_fast: true,
      ..config(2)
    };
    let result = run(&graph, &context(&temp), &cfg).await.unwrap();
    assert_eq!(result.state(&target("//slow:slow")), Some(ExecutionState::Built));
    assert_eq!(result.state(&target("//bad:bad")), Some(ExecutionState::Failed));
  }

  #[tokio::test]
  async fn prepopulated_cache_skips_execution() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let action = scripted("//a:a", &[], Behavior::Succeed, &journal);
    let fp = rulekey::fingerprint(&action, &[], temp.path()).unwrap();

    let src = TempDir::new().unwrap();
    std::fs::write(src.path().join("out.txt"), "from cache").unwrap();
    let artifact = crate::artifact::pack_outputs(src.path(), &["out.txt".to_string()]).unwrap();

    let local = Arc::new(MemoryCache::new());
    local.put(&fp, &artifact).await.unwrap();
    let ctx = context(&temp).with_cache(TieredCache::new(local));

    let graph = ActionGraph::build(vec![action]).unwrap();
    let result = run(&graph, &ctx, &config(2)).await.unwrap();

    assert_eq!(result.state(&target("//a:a")), Some(ExecutionState::CacheHit));
    assert_eq!(result.outcome(&target("//a:a")).unwrap().fingerprint, Some(fp));
    assert_eq!(journal.total_calls(), 0);
    let out = ctx.output_dir(&target("//a:a")).join("out.txt");
    assert_eq!(std::fs::read_to_string(out).unwrap(), "from cache");
  }

  #[tokio::test]
  async fn second_run_is_fully_cached() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let ctx = context(&temp).with_cache(TieredCache::new(Arc::new(MemoryCache::new())));
    let graph = diamond(Behavior::Succeed, &journal);

    let first = run(&graph, &ctx, &config(4)).await.unwrap();
    assert_eq!(first.counts.built, 4);

    let second = run(&graph, &ctx, &config(4)).await.unwrap();
    assert_eq!(second.counts.cache_hit, 4);
    assert_eq!(journal.total_calls(), 4);
    assert_ne!(first.build_id, second.build_id);
  }

  #[tokio::test]
  async fn uncacheable_actions_always_execute() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let ctx = context(&temp).with_cache(TieredCache::new(Arc::new(MemoryCache::new())));
    let graph = ActionGraph::build(vec![
      scripted("//a:a", &[], Behavior::Succeed, &journal).with_cache_policy(CachePolicy::Uncacheable),
    ])
    .unwrap();

    for _ in 0..2 {
      let result = run(&graph, &ctx, &config(1)).await.unwrap();
      assert_eq!(result.state(&target("//a:a")), Some(ExecutionState::Built));
    }
    assert_eq!(journal.calls(&target("//a:a")), 2);
  }

  #[tokio::test]
  async fn outcome_set_is_independent_of_concurrency() {
    let build = |journal: &Arc<Journal>| {
      ActionGraph::build(vec![
        scripted("//a:a", &[], Behavior::Succeed, journal),
        scripted("//b:b", &["//a:a"], Behavior::Fail("b".to_string()), journal),
        scripted("//c:c", &["//a:a"], Behavior::Succeed, journal),
        scripted("//d:d", &["//b:b", "//c:c"], Behavior::Succeed, journal),
        scripted("//e:e", &["//c:c"], Behavior::Succeed, journal),
        scripted("//f:f", &[], Behavior::Succeed, journal),
      ])
      .unwrap()
    };

    let temp1 = TempDir::new().unwrap();
    let serial = run(&build(&Journal::new()), &context(&temp1), &config(1)).await.unwrap();
    let temp8 = TempDir::new().unwrap();
    let parallel = run(&build(&Journal::new()), &context(&temp8), &config(8)).await.unwrap();

    assert_eq!(serial.outcome_set(), parallel.outcome_set());
    assert_eq!(serial.counts, parallel.counts);
  }

  #[tokio::test]
  async fn concurrency_limit_is_respected() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let actions: Vec<Action> = (0..6)
      .map(|i| scripted(&format!("//p:a{}", i), &[], Behavior::Sleep(Duration::from_millis(40)), &journal))
      .collect();
    let graph = ActionGraph::build(actions).unwrap();

    let result = run(&graph, &context(&temp), &config(2)).await.unwrap();
    assert!(result.is_success());
    assert!(journal.max_active() <= 2);
    assert_eq!(journal.total_calls(), 6);
  }

  #[tokio::test]
  async fn zero_concurrency_is_clamped() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let result = run(&diamond(Behavior::Succeed, &journal), &context(&temp), &config(0))
      .await
      .unwrap();
    assert!(result.is_success());
  }

  #[tokio::test]
  async fn ready_actions_with_more_dependents_go_first() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let graph = ActionGraph::build(vec![
      scripted("//leaf:first", &[], Behavior::Succeed, &journal),
      scripted("//leaf:second", &[], Behavior::Succeed, &journal),
      scripted("//hub:hub", &[], Behavior::Succeed, &journal),
      scripted("//hub:x", &["//hub:hub"], Behavior::Succeed, &journal),
      scripted("//hub:y", &["//hub:x"], Behavior::Succeed, &journal),
    ])
    .unwrap();

    run(&graph, &context(&temp), &config(1)).await.unwrap();
    let order = journal.order();
    assert_eq!(order[0], target("//hub:hub"));
    assert_eq!(order[1], target("//hub:x"));
    // Ties fall back to insertion order
    let first = order.iter().position(|t| t == &target("//leaf:first")).unwrap();
    let second = order.iter().position(|t| t == &target("//leaf:second")).unwrap();
    assert!(first < second);
  }

  #[tokio::test]
  async fn timeout_fails_action_and_skips_dependents() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let graph = ActionGraph::build(vec![
      scripted("//a:a", &[], Behavior::Sleep(Duration::from_secs(30)), &journal)
        .with_timeout(Duration::from_millis(50)),
      scripted("//b:b", &["//a:a"], Behavior::Succeed, &journal),
    ])
    .unwrap();

    let result = run(&graph, &context(&temp), &config(2)).await.unwrap();
    assert_eq!(
      result.outcome(&target("//a:a")).unwrap().cause,
      Some(FailureCause::Timeout { limit_ms: 50 })
    );
    assert_eq!(result.state(&target("//b:b")), Some(ExecutionState::Skipped));
  }

  #[tokio::test]
  async fn config_timeout_applies_to_every_action() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let graph =
      ActionGraph::build(vec![scripted("//a:a", &[], Behavior::Sleep(Duration::from_secs(30)), &journal)]).unwrap();
    let cfg = ExecuteConfig {
      action_timeout: Some(Duration::from_millis(20)),
      ..config(1)
    };

    let result = run(&graph, &context(&temp), &cfg).await.unwrap();
    assert!(matches!(
      result.outcome(&target("//a:a")).unwrap().cause,
      Some(FailureCause::Timeout { .. })
    ));
  }

  #[tokio::test]
  async fn cancellation_is_cooperative_within_grace() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let graph = ActionGraph::build(vec![
      scripted("//a:a", &[], Behavior::WaitForCancel, &journal),
      scripted("//b:b", &["//a:a"], Behavior::Succeed, &journal),
    ])
    .unwrap();

    let cancel = CancellationToken::new();
    let ctx = context(&temp).with_cancel(cancel.clone());
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      cancel.cancel();
    });

    let result = run(&graph, &ctx, &config(2)).await.unwrap();
    assert_eq!(
      result.outcome(&target("//a:a")).unwrap().cause,
      Some(FailureCause::Cancelled)
    );
    assert_eq!(result.state(&target("//b:b")), Some(ExecutionState::Skipped));
  }

  #[tokio::test]
  async fn grace_expiry_abandons_uncooperative_steps() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let graph = ActionGraph::build(vec![
      scripted("//stuck:stuck", &[], Behavior::Sleep(Duration::from_secs(60)), &journal),
      scripted("//later:later", &["//stuck:stuck"], Behavior::Succeed, &journal),
    ])
    .unwrap();

    let cancel = CancellationToken::new();
    let ctx = context(&temp).with_cancel(cancel.clone());
    let cfg = ExecuteConfig {
      cancel_grace: Duration::from_millis(100),
      ..config(1)
    };
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      cancel.cancel();
    });

    let started = Instant::now();
    let result = run(&graph, &ctx, &cfg).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(
      result.outcome(&target("//stuck:stuck")).unwrap().cause,
      Some(FailureCause::Cancelled)
    );
    assert_eq!(result.state(&target("//later:later")), Some(ExecutionState::Skipped));
  }

  #[tokio::test]
  async fn cancelled_before_start_runs_nothing() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let ctx = context(&temp).with_cancel(cancel);

    let result = run(&diamond(Behavior::Succeed, &journal), &ctx, &config(4)).await.unwrap();
    assert_eq!(journal.total_calls(), 0);
    assert_eq!(result.counts.skipped, 4);
    for (_, reason) in result.skipped() {
      assert_eq!(reason, &SkipReason::Cancelled);
    }
  }

  #[tokio::test]
  async fn panicking_step_is_a_failure() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let result = run(&diamond(Behavior::Panic, &journal), &context(&temp), &config(2))
      .await
      .unwrap();

    let cause = result.outcome(&target("//a:a")).unwrap().cause.clone();
    assert!(matches!(cause, Some(FailureCause::ActionExecution { ref message }) if message.contains("panicked")));
    assert_eq!(result.counts.skipped, 3);
  }

  #[tokio::test]
  async fn missing_input_fails_the_action() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let graph = ActionGraph::build(vec![
      scripted("//a:a", &[], Behavior::Succeed, &journal).with_inputs([PathBuf::from("missing.c")]),
    ])
    .unwrap();

    let result = run(&graph, &context(&temp), &config(1)).await.unwrap();
    assert_eq!(result.state(&target("//a:a")), Some(ExecutionState::Failed));
    assert_eq!(journal.total_calls(), 0);
  }

  #[derive(Debug)]
  struct DamagedTier;

  #[async_trait]
  impl CacheTier for DamagedTier {
    fn name(&self) -> &str {
      "damaged"
    }

    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
      Err(CacheError::Unrecoverable {
        fingerprint: *fingerprint,
        message: "read-only filesystem".to_string(),
      })
    }

    async fn put(&self, _: &Fingerprint, _: &Artifact) -> Result<ArtifactMeta, CacheError> {
      unreachable!("nothing is published after a fatal read")
    }

    async fn contains(&self, _: &Fingerprint) -> Result<bool, CacheError> {
      Ok(false)
    }
  }

  #[tokio::test]
  async fn unrecoverable_cache_error_aborts_run() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let ctx = context(&temp).with_cache(TieredCache::new(Arc::new(DamagedTier)));

    let err = run(&diamond(Behavior::Succeed, &journal), &ctx, &config(1))
      .await
      .unwrap_err();
    assert!(matches!(err, ExecuteError::Cache(CacheError::Unrecoverable { .. })));
  }

  #[tokio::test]
  async fn observer_sees_every_transition() {
    let temp = TempDir::new().unwrap();
    let journal = Journal::new();
    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let ctx = context(&temp).with_observer(Arc::new(move |event: &BuildEvent| {
      sink.lock().unwrap().push(event.clone());
    }));

    let graph = diamond(Behavior::Succeed, &journal);
    run(&graph, &ctx, &config(2)).await.unwrap();

    let events = events.lock().unwrap();
    assert!(matches!(events.first(), Some(BuildEvent::Started { total: 4, .. })));
    assert!(matches!(events.last(), Some(BuildEvent::Finished { .. })));

    // No action starts before its dependencies have succeeded
    let mut done = std::collections::HashSet::new();
    for event in events.iter() {
      if let BuildEvent::StateChanged(change) = event {
        if change.state == ExecutionState::Running {
          for dep in graph.dependencies(&change.target) {
            assert!(done.contains(&dep), "{} started before {}", change.target, dep);
          }
        }
        if change.state.is_success() {
          done.insert(change.target.clone());
        }
      }
    }
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn command_steps_materialize_outputs() {
    use crate::action::actions::CmdStep;

    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("name.txt"), "keel").unwrap();
    let graph = ActionGraph::build(vec![
      Action::new(target("//gen:greeting"), Arc::new(CmdStep::new("echo hello $(cat name.txt) > $out/greeting.txt")))
        .with_inputs([PathBuf::from("name.txt")])
        .with_outputs(["greeting.txt".to_string()]),
      Action::new(
        target("//gen:shout"),
        Arc::new(CmdStep::new(
          "tr a-z A-Z < keel-out/gen/__greeting__/greeting.txt > $out/shout.txt",
        )),
      )
      .with_deps([target("//gen:greeting")])
      .with_outputs(["shout.txt".to_string()]),
    ])
    .unwrap();

    let ctx = context(&temp);
    let result = run(&graph, &ctx, &config(2)).await.unwrap();
    assert!(result.is_success(), "{:?}", result.summary_lines());

    let shout = ctx.output_dir(&target("//gen:shout")).join("shout.txt");
    assert_eq!(std::fs::read_to_string(shout).unwrap(), "HELLO KEEL\n");
  }
}
