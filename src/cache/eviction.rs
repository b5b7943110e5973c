//! Eviction policies.
//!
//! Policies are pure functions over a snapshot of entry metadata: they never
//! touch a live cache, so they can be tested without one and shared by the
//! memory and disk tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::entry::CacheEntry;

/// Which entries go first when a tier is over capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
  /// Least recently used (by the later of creation and last access)
  #[default]
  Lru,
  /// Least frequently used
  Lfu,
  /// First in, first out
  Fifo,
}

impl std::fmt::Display for EvictionPolicy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EvictionPolicy::Lru => write!(f, "LRU"),
      EvictionPolicy::Lfu => write!(f, "LFU"),
      EvictionPolicy::Fifo => write!(f, "FIFO"),
    }
  }
}

/// Snapshot of the metadata eviction decisions are made on.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCandidate<K> {
  pub key: K,
  pub created_at: DateTime<Utc>,
  pub last_access_time: Option<DateTime<Utc>>,
  pub access_count: u64,
  /// Bytes the entry occupies
  pub size: u64,
  /// Insertion order; breaks every tie
  pub sequence: u64,
  /// Logical clock of the last write or read; breaks LRU timestamp ties
  pub touched: u64,
}

impl<K> EvictionCandidate<K> {
  /// Snapshot an in-memory entry.
  pub fn from_entry<V>(key: K, entry: &CacheEntry<V>) -> Self {
    Self {
      key,
      created_at: entry.created_at,
      last_access_time: entry.last_access_time,
      access_count: entry.access_count,
      size: entry.size.unwrap_or(0),
      sequence: entry.sequence,
      touched: entry.touched,
    }
  }

  fn recency(&self) -> DateTime<Utc> {
    match self.last_access_time {
      Some(accessed) if accessed > self.created_at => accessed,
      _ => self.created_at,
    }
  }
}

impl EvictionPolicy {
  fn compare<K>(&self, a: &EvictionCandidate<K>, b: &EvictionCandidate<K>) -> Ordering {
    let primary = match self {
      EvictionPolicy::Lru => a
        .recency()
        .cmp(&b.recency())
        .then(a.touched.cmp(&b.touched)),
      EvictionPolicy::Lfu => a.access_count.cmp(&b.access_count),
      EvictionPolicy::Fifo => a.created_at.cmp(&b.created_at),
    };
    primary.then(a.sequence.cmp(&b.sequence))
  }

  /// All candidates in eviction order (first element goes first).
  pub fn order<'a, K>(
    &self,
    candidates: &'a [EvictionCandidate<K>],
  ) -> Vec<&'a EvictionCandidate<K>> {
    let mut ordered: Vec<_> = candidates.iter().collect();
    ordered.sort_by(|a, b| self.compare(a, b));
    ordered
  }

  /// Keys to remove so that at most `target_size` entries remain.
  ///
  /// Returns an empty list when the snapshot already fits.
  pub fn select_keys_to_evict<K: Clone>(
    &self,
    candidates: &[EvictionCandidate<K>],
    target_size: usize,
  ) -> Vec<K> {
    if candidates.len() <= target_size {
      return Vec::new();
    }
    let excess = candidates.len() - target_size;
    self
      .order(candidates)
      .into_iter()
      .take(excess)
      .map(|c| c.key.clone())
      .collect()
  }

  /// Keys to remove so that at least `bytes_to_free` bytes are released.
  pub fn select_keys_to_free<K: Clone>(
    &self,
    candidates: &[EvictionCandidate<K>],
    bytes_to_free: u64,
  ) -> Vec<K> {
    let mut freed = 0u64;
    let mut keys = Vec::new();
    for candidate in self.order(candidates) {
      if freed >= bytes_to_free {
        break;
      }
      freed += candidate.size;
      keys.push(candidate.key.clone());
    }
    keys
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn base() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
      .unwrap()
      .with_timezone(&Utc)
  }

  fn candidate(
    key: &'static str,
    created_secs: i64,
    sequence: u64,
  ) -> EvictionCandidate<&'static str> {
    EvictionCandidate {
      key,
      created_at: base() + Duration::seconds(created_secs),
      last_access_time: None,
      access_count: 0,
      size: 10,
      sequence,
      touched: sequence,
    }
  }

  #[test]
  fn test_nothing_to_evict_when_within_target() {
    let candidates = vec![candidate("a", 0, 0), candidate("b", 1, 1)];
    for policy in [EvictionPolicy::Lru, EvictionPolicy::Lfu, EvictionPolicy::Fifo] {
      assert!(policy.select_keys_to_evict(&candidates, 2).is_empty());
      assert!(policy.select_keys_to_evict(&candidates, 5).is_empty());
    }
  }

  #[test]
  fn test_lru_evicts_least_recently_used() {
    // A, B, C inserted, then A touched
    let mut a = candidate("a", 0, 0);
    a.last_access_time = Some(base() + Duration::seconds(3));
    a.touched = 3;
    let candidates = vec![a, candidate("b", 1, 1), candidate("c", 2, 2), candidate("d", 4, 4)];

    let evicted = EvictionPolicy::Lru.select_keys_to_evict(&candidates, 3);
    assert_eq!(evicted, vec!["b"]);
  }

  #[test]
  fn test_lru_timestamp_tie_uses_logical_clock() {
    let mut a = candidate("a", 0, 0);
    a.touched = 5;
    let b = candidate("b", 0, 1);

    let evicted = EvictionPolicy::Lru.select_keys_to_evict(&[a, b], 1);
    assert_eq!(evicted, vec!["b"]);
  }

  #[test]
  fn test_lfu_evicts_least_frequent_with_insertion_tie_break() {
    let mut a = candidate("a", 0, 0);
    a.access_count = 5;
    let mut b = candidate("b", 1, 1);
    b.access_count = 1;
    let mut c = candidate("c", 2, 2);
    c.access_count = 1;
    let d = candidate("d", 3, 3);

    let evicted = EvictionPolicy::Lfu.select_keys_to_evict(&[a, b, c, d], 1);
    // d has zero accesses; b and c tie and b was inserted first
    assert_eq!(evicted, vec!["d", "b", "c"]);
  }

  #[test]
  fn test_fifo_evicts_oldest_regardless_of_access() {
    let mut a = candidate("a", 0, 0);
    a.access_count = 100;
    a.last_access_time = Some(base() + Duration::seconds(10));
    let candidates = vec![candidate("c", 2, 2), a, candidate("b", 1, 1)];

    let evicted = EvictionPolicy::Fifo.select_keys_to_evict(&candidates, 1);
    assert_eq!(evicted, vec!["a", "b"]);
  }

  #[test]
  fn test_fifo_same_timestamp_keeps_insertion_order() {
    let candidates = vec![candidate("y", 0, 7), candidate("x", 0, 3), candidate("z", 0, 9)];
    let evicted = EvictionPolicy::Fifo.select_keys_to_evict(&candidates, 0);
    assert_eq!(evicted, vec!["x", "y", "z"]);
  }

  #[test]
  fn test_select_keys_to_free_stops_once_enough_is_released() {
    let candidates = vec![candidate("a", 0, 0), candidate("b", 1, 1), candidate("c", 2, 2)];
    assert_eq!(EvictionPolicy::Fifo.select_keys_to_free(&candidates, 15), vec!["a", "b"]);
    assert!(EvictionPolicy::Fifo.select_keys_to_free(&candidates, 0).is_empty());
  }

  #[test]
  fn test_selection_is_deterministic() {
    let candidates: Vec<_> = (0..20).map(|i| candidate("k", i % 3, i as u64)).collect();
    let first = EvictionPolicy::Lru.order(&candidates);
    let second = EvictionPolicy::Lru.order(&candidates);
    let seq = |v: Vec<&EvictionCandidate<&str>>| v.iter().map(|c| c.sequence).collect::<Vec<_>>();
    assert_eq!(seq(first), seq(second));
  }
}
