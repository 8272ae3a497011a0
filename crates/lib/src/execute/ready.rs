//! Ready set ordering.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::action::Target;

#[derive(Debug, PartialEq, Eq)]
struct ReadyItem {
  dependents: usize,
  order: usize,
  target: Target,
}

impl Ord for ReadyItem {
  fn cmp(&self, other: &Self) -> Ordering {
    // Max-heap: more dependents first, then earlier insertion
    self
      .dependents
      .cmp(&other.dependents)
      .then_with(|| other.order.cmp(&self.order))
  }
}

impl PartialOrd for ReadyItem {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

/// Actions whose dependencies have all succeeded, popped in dispatch order:
/// most transitive dependents first, insertion order for ties.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
  heap: BinaryHeap<ReadyItem>,
}

impl ReadyQueue {
  pub(crate) fn push(&mut self, target: Target, dependents: usize, order: usize) {
    self.heap.push(ReadyItem {
      dependents,
      order,
      target,
    });
  }

  pub(crate) fn pop(&mut self) -> Option<Target> {
    self.heap.pop().map(|item| item.target)
  }

  pub(crate) fn clear(&mut self) {
    self.heap.clear();
  }
}
