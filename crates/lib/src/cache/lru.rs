//! Access-ordered index shared by the bounded local tiers.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::rulekey::Fingerprint;

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
  size: u64,
  last_access: u128,
  pins: usize,
}

/// Tracks entry sizes, access stamps and read pins.
///
/// Access stamps come from the wall clock in nanoseconds but are forced to be
/// strictly increasing, so two accesses never compare equal.
#[derive(Debug, Default)]
pub(crate) struct LruIndex {
  entries: HashMap<Fingerprint, IndexEntry>,
  total_bytes: u64,
  last_stamp: u128,
  max_bytes: Option<u64>,
}

impl LruIndex {
  pub(crate) fn new(max_bytes: Option<u64>) -> Self {
    Self {
      max_bytes,
      ..Self::default()
    }
  }

  fn next_stamp(&mut self) -> u128 {
    let now = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_nanos())
      .unwrap_or(0);
    self.last_stamp = now.max(self.last_stamp + 1);
    self.last_stamp
  }

  pub(crate) fn max_bytes(&self) -> Option<u64> {
    self.max_bytes
  }

  pub(crate) fn len(&self) -> usize {
    self.entries.len()
  }

  pub(crate) fn total_bytes(&self) -> u64 {
    self.total_bytes
  }

  pub(crate) fn contains(&self, fp: &Fingerprint) -> bool {
    self.entries.contains_key(fp)
  }

  /// Record a new entry as just accessed. Returns false if it already existed.
  pub(crate) fn insert(&mut self, fp: Fingerprint, size: u64) -> bool {
    let stamp = self.next_stamp();
    self.insert_with_stamp(fp, size, stamp)
  }

  /// Record an entry with a known access stamp (used when rebuilding from disk).
  pub(crate) fn insert_with_stamp(&mut self, fp: Fingerprint, size: u64, stamp: u128) -> bool {
    if self.entries.contains_key(&fp) {
      return false;
    }
    self.last_stamp = self.last_stamp.max(stamp);
    self.entries.insert(
      fp,
      IndexEntry {
        size,
        last_access: stamp,
        pins: 0,
      },
    );
    self.total_bytes += size;
    true
  }

  pub(crate) fn touch(&mut self, fp: &Fingerprint) {
    let stamp = self.next_stamp();
    if let Some(entry) = self.entries.get_mut(fp) {
      entry.last_access = stamp;
    }
  }

  /// Pin an entry against eviction. Returns false if it is not indexed.
  pub(crate) fn pin(&mut self, fp: &Fingerprint) -> bool {
    match self.entries.get_mut(fp) {
      Some(entry) => {
        entry.pins += 1;
        true
      }
      None => false,
    }
  }

  pub(crate) fn unpin(&mut self, fp: &Fingerprint) {
    if let Some(entry) = self.entries.get_mut(fp) {
      entry.pins = entry.pins.saturating_sub(1);
    }
  }

  pub(crate) fn remove(&mut self, fp: &Fingerprint) -> Option<u64> {
    let entry = self.entries.remove(fp)?;
    self.total_bytes -= entry.size;
    Some(entry.size)
  }

  /// Least recently used entries to drop so the total fits in `limit`.
  ///
  /// Pinned entries and `protect` are never returned, so the result may not
  /// be enough to get under the limit.
  pub(crate) fn victims(&self, limit: u64, protect: Option<&Fingerprint>) -> Vec<Fingerprint> {
    if self.total_bytes <= limit {
      return Vec::new();
    }

    let mut candidates: Vec<(&Fingerprint, &IndexEntry)> = self
      .entries
      .iter()
      .filter(|(fp, entry)| entry.pins == 0 && Some(*fp) != protect)
      .collect();
    candidates.sort_by_key(|(_, entry)| entry.last_access);

    let mut excess = self.total_bytes - limit;
    let mut victims = Vec::new();
    for (fp, entry) in candidates {
      if excess == 0 {
        break;
      }
      victims.push(*fp);
      excess = excess.saturating_sub(entry.size);
    }
    victims
  }

  /// Victims needed to respect the configured bound, if any.
  pub(crate) fn over_budget(&self, protect: Option<&Fingerprint>) -> Vec<Fingerprint> {
    match self.max_bytes {
      Some(limit) => self.victims(limit, protect),
      None => Vec::new(),
    }
  }
}
