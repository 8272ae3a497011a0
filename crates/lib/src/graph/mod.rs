//! The action graph.
//!
//! An immutable DAG of [`Action`]s backed by a petgraph `DiGraph`, with edges
//! pointing from a dependency to its dependent. Construction validates that
//! every dependency exists and that there are no cycles, so everything
//! downstream (rule keys, the scheduler) may assume a well-formed DAG.

mod pattern;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use serde::Deserialize;
use thiserror::Error;

use crate::action::{Action, ActionSpec, Fingerprintable, Identifiable, Target};
use crate::artifact::validate_output_path;

pub use pattern::{PatternError, TargetPattern};

/// Errors produced while constructing or querying an action graph.
#[derive(Debug, Error)]
pub enum GraphError {
  /// The dependency relation contains a cycle. The sequence starts and ends
  /// with the same target and follows dependency edges.
  #[error("dependency cycle detected: {}", format_cycle(.cycle))]
  Cycle { cycle: Vec<Target> },

  #[error("duplicate target {0}")]
  DuplicateTarget(Target),

  #[error("{target} depends on unknown target {dependency}")]
  UnknownDependency { target: Target, dependency: Target },

  #[error("{target} declares invalid output `{output}`")]
  InvalidOutput { target: Target, output: String },

  #[error("pattern {0} matches no targets")]
  NoMatch(String),

  #[error(transparent)]
  Pattern(#[from] PatternError),

  #[error("failed to parse graph file: {0}")]
  Parse(#[from] serde_json::Error),
}

fn format_cycle(cycle: &[Target]) -> String {
  cycle.iter().map(Target::to_string).collect::<Vec<_>>().join(" -> ")
}

/// On-disk graph file: `{"actions": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GraphFile {
  actions: Vec<ActionSpec>,
}

/// Immutable DAG of actions.
///
/// Node indices follow insertion order, which is used as the final tie-break
/// wherever an order between independent actions is needed.
#[derive(Debug, Clone)]
pub struct ActionGraph {
  graph: DiGraph<Arc<Action>, ()>,
  nodes: HashMap<Target, NodeIndex>,
}

impl ActionGraph {
  /// Build a graph from a set of actions.
  ///
  /// # Errors
  ///
  /// - `DuplicateTarget` if two actions share a target
  /// - `UnknownDependency` if a dependency is not among `actions`
  /// - `InvalidOutput` if a declared output escapes the output directory
  /// - `Cycle` if the dependencies are cyclic (a self-dependency is a
  ///   one-node cycle)
  pub fn build(actions: impl IntoIterator<Item = Action>) -> Result<Self, GraphError> {
    Self::from_shared(actions.into_iter().map(Arc::new))
  }

  fn from_shared(actions: impl IntoIterator<Item = Arc<Action>>) -> Result<Self, GraphError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    // First pass: one node per action
    for action in actions {
      for output in action.declared_outputs() {
        validate_output_path(output).map_err(|_| GraphError::InvalidOutput {
          target: action.target().clone(),
          output: output.clone(),
        })?;
      }
      let target = action.target().clone();
      if nodes.contains_key(&target) {
        return Err(GraphError::DuplicateTarget(target));
      }
      let idx = graph.add_node(action);
      nodes.insert(target, idx);
    }

    // Second pass: edges from dependency to dependent
    let indices: Vec<NodeIndex> = graph.node_indices().collect();
    for idx in indices {
      let action = Arc::clone(&graph[idx]);
      for dep in action.deps() {
        if dep == action.target() {
          return Err(GraphError::Cycle {
            cycle: vec![dep.clone(), dep.clone()],
          });
        }
        let dep_idx = *nodes.get(dep).ok_or_else(|| GraphError::UnknownDependency {
          target: action.target().clone(),
          dependency: dep.clone(),
        })?;
        graph.update_edge(dep_idx, idx, ());
      }
    }

    let dag = Self { graph, nodes };
    dag.verify_acyclic()?;
    Ok(dag)
  }

  /// Load a graph from the JSON graph file format.
  pub fn from_json(json: &str) -> Result<Self, GraphError> {
    let file: GraphFile = serde_json::from_str(json)?;
    Self::build(file.actions.into_iter().map(ActionSpec::into_action))
  }

  /// Verify that the graph is acyclic, reporting one cycle if it is not.
  ///
  /// Picks the strongly connected component containing the smallest cyclic
  /// target so the reported cycle does not depend on hash order.
  fn verify_acyclic(&self) -> Result<(), GraphError> {
    let cyclic = tarjan_scc(&self.graph)
      .into_iter()
      .filter(|scc| scc.len() > 1)
      .min_by(|a, b| self.min_target(a).cmp(&self.min_target(b)));

    match cyclic {
      Some(scc) => Err(GraphError::Cycle {
        cycle: self.cycle_path(&scc),
      }),
      None => Ok(()),
    }
  }

  fn min_target<'a>(&'a self, scc: &[NodeIndex]) -> Option<&'a Target> {
    scc.iter().map(|&idx| self.graph[idx].target()).min()
  }

  /// Shortest dependency path from the smallest target of `scc` back to itself.
  fn cycle_path(&self, scc: &[NodeIndex]) -> Vec<Target> {
    let members: HashSet<NodeIndex> = scc.iter().copied().collect();
    let Some(&start) = scc.iter().min_by(|&&a, &&b| self.graph[a].target().cmp(self.graph[b].target())) else {
      return Vec::new();
    };

    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
      // Incoming edges lead to the node's dependencies
      let mut deps: Vec<NodeIndex> = self
        .graph
        .neighbors_directed(node, Direction::Incoming)
        .filter(|n| members.contains(n))
        .collect();
      deps.sort_by(|&a, &b| self.graph[a].target().cmp(self.graph[b].target()));

      for dep in deps {
        if dep == start {
          let mut path = vec![start];
          let mut cur = node;
          while cur != start {
            path.push(cur);
            cur = parent[&cur];
          }
          path[1..].reverse();
          path.push(start);
          return path.into_iter().map(|idx| self.graph[idx].target().clone()).collect();
        }
        if !parent.contains_key(&dep) {
          parent.insert(dep, node);
          queue.push_back(dep);
        }
      }
    }

    Vec::new()
  }

  /// Group actions into layers where every dependency of an action lies in an
  /// earlier layer. Targets within a layer are sorted.
  pub fn topological_layers(&self) -> Vec<Vec<Target>> {
    // Kahn's algorithm, one level at a time
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();

    let mut current: Vec<NodeIndex> = self.graph.node_indices().filter(|idx| in_degree[idx] == 0).collect();
    let mut layers = Vec::new();

    while !current.is_empty() {
      let mut next = Vec::new();
      for &idx in &current {
        for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&dependent) {
            *deg -= 1;
            if *deg == 0 {
              next.push(dependent);
            }
          }
        }
      }

      let mut layer: Vec<Target> = current.iter().map(|&idx| self.graph[idx].target().clone()).collect();
      layer.sort();
      layers.push(layer);
      current = next;
    }

    layers
  }

  pub fn get(&self, target: &Target) -> Option<&Arc<Action>> {
    self.nodes.get(target).map(|&idx| &self.graph[idx])
  }

  pub fn contains(&self, target: &Target) -> bool {
    self.nodes.contains_key(target)
  }

  /// Direct dependencies of a target, in declaration order.
  pub fn dependencies(&self, target: &Target) -> Vec<Target> {
    self.get(target).map(|action| action.deps().to_vec()).unwrap_or_default()
  }

  /// Direct dependents of a target, sorted.
  pub fn dependents(&self, target: &Target) -> Vec<Target> {
    let Some(&idx) = self.nodes.get(target) else {
      return Vec::new();
    };

    let mut dependents: Vec<Target> = self
      .graph
      .neighbors_directed(idx, Direction::Outgoing)
      .map(|n| self.graph[n].target().clone())
      .collect();
    dependents.sort();
    dependents
  }

  /// Number of actions that depend on each target, directly or transitively.
  pub fn transitive_dependent_counts(&self) -> HashMap<Target, usize> {
    self
      .graph
      .node_indices()
      .map(|idx| {
        let mut dfs = Dfs::new(&self.graph, idx);
        let mut count = 0;
        while dfs.next(&self.graph).is_some() {
          count += 1;
        }
        // The start node is visited too
        (self.graph[idx].target().clone(), count - 1)
      })
      .collect()
  }

  /// Restrict the graph to the targets matching any pattern, plus everything
  /// they depend on.
  ///
  /// # Errors
  ///
  /// Returns `Pattern` for a malformed pattern and `NoMatch` for a pattern
  /// that selects nothing.
  pub fn select<S: AsRef<str>>(&self, patterns: &[S]) -> Result<Self, GraphError> {
    let patterns = patterns
      .iter()
      .map(|p| TargetPattern::parse(p.as_ref()))
      .collect::<Result<Vec<_>, _>>()?;

    let mut roots = Vec::new();
    for pattern in &patterns {
      let matched: Vec<NodeIndex> = self
        .graph
        .node_indices()
        .filter(|&idx| pattern.matches(self.graph[idx].target()))
        .collect();
      if matched.is_empty() {
        return Err(GraphError::NoMatch(pattern.to_string()));
      }
      roots.extend(matched);
    }

    // Walk against edge direction to collect dependencies
    let reversed = Reversed(&self.graph);
    let mut keep: HashSet<NodeIndex> = HashSet::new();
    for root in roots {
      if keep.contains(&root) {
        continue;
      }
      let mut dfs = Dfs::new(reversed, root);
      while let Some(idx) = dfs.next(reversed) {
        keep.insert(idx);
      }
    }

    Self::from_shared(
      self
        .graph
        .node_indices()
        .filter(|idx| keep.contains(idx))
        .map(|idx| Arc::clone(&self.graph[idx])),
    )
  }

  /// Actions in insertion order.
  pub fn iter(&self) -> impl Iterator<Item = &Arc<Action>> {
    self.graph.node_indices().map(|idx| &self.graph[idx])
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }
}
