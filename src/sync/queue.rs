//! Persistent queue of mutations waiting to reach the remote service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::{
  CacheConfig, CacheError, CacheStore, CacheStrategy, DiskCache, EvictionPolicy, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

/// A local write to replay against the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
  pub collection: String,
  pub entity_id: String,
  pub kind: MutationKind,
  pub payload: Value,
  /// When the local change was made
  pub modified_at: DateTime<Utc>,
  /// Remote `modified_at` the local change was based on, if known
  pub base_modified_at: Option<DateTime<Utc>>,
  pub queued_at: Option<DateTime<Utc>>,
  /// Set when the remote permanently refused the mutation
  pub rejected: Option<String>,
}

impl PendingMutation {
  pub fn new(
    collection: impl Into<String>,
    entity_id: impl Into<String>,
    kind: MutationKind,
    payload: Value,
  ) -> Self {
    Self {
      collection: collection.into(),
      entity_id: entity_id.into(),
      kind,
      payload,
      modified_at: Utc::now(),
      base_modified_at: None,
      queued_at: None,
      rejected: None,
    }
  }

  pub fn based_on(mut self, remote_modified_at: DateTime<Utc>) -> Self {
    self.base_modified_at = Some(remote_modified_at);
    self
  }
}

/// FIFO of `PendingMutation`s stored in a `DiskCache`, so queued writes
/// survive restarts. Keys are zero-padded sequence numbers.
pub struct MutationQueue {
  store: DiskCache<String, PendingMutation>,
  next_seq: Mutex<u64>,
  capacity: usize,
}

fn queue_key(seq: u64) -> String {
  format!("{:020}", seq)
}

impl MutationQueue {
  /// Open (or create) the queue in `dir`. Pushing beyond `capacity`
  /// mutations fails rather than evicting queued writes.
  pub fn open(dir: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
    let config = CacheConfig {
      strategy: CacheStrategy::DiskOnly,
      eviction_policy: EvictionPolicy::Fifo,
      max_size: capacity,
      max_disk_size: u64::MAX,
      default_ttl: Duration::ZERO,
      cleanup_interval: Duration::ZERO,
      key_prefix: "mutation:".to_string(),
      ..CacheConfig::default()
    };
    let store: DiskCache<String, PendingMutation> = DiskCache::open(dir, config)?;
    let next_seq = store
      .keys()?
      .iter()
      .filter_map(|key| key.parse::<u64>().ok())
      .max()
      .map_or(0, |seq| seq + 1);
    let queue = Self {
      store,
      next_seq: Mutex::new(next_seq),
      capacity,
    };
    info!(pending = queue.len()?, "Opened mutation queue");
    Ok(queue)
  }

  /// Append a mutation. Returns its queue key.
  pub fn push(&self, mut mutation: PendingMutation) -> Result<String> {
    let mut next_seq = self.next_seq.lock().map_err(CacheError::poisoned)?;
    if self.store.size()? >= self.capacity {
      return Err(CacheError::CapacityExceeded(format!(
        "mutation queue holds {} entries",
        self.capacity
      )));
    }
    let key = queue_key(*next_seq);
    *next_seq += 1;
    mutation.queued_at = Some(Utc::now());
    debug!(
      key = %key,
      collection = %mutation.collection,
      entity = %mutation.entity_id,
      kind = ?mutation.kind,
      "Queued mutation"
    );
    self.store.set(key.clone(), mutation, None)?;
    Ok(key)
  }

  /// All entries in queue order, rejected ones included.
  pub fn entries(&self) -> Result<Vec<(String, PendingMutation)>> {
    let mut keys = self.store.keys()?;
    keys.sort();
    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
      if let Some(entry) = self.store.get_entry(&key)? {
        entries.push((key, entry.value));
      }
    }
    Ok(entries)
  }

  /// Oldest `limit` mutations still eligible for replay.
  pub fn peek_batch(&self, limit: usize) -> Result<Vec<(String, PendingMutation)>> {
    Ok(
      self
        .entries()?
        .into_iter()
        .filter(|(_, mutation)| mutation.rejected.is_none())
        .take(limit)
        .collect(),
    )
  }

  /// Remove a mutation that has been applied or superseded.
  pub fn ack(&self, key: &str) -> Result<bool> {
    self.store.remove(&key.to_string())
  }

  /// Keep a refused mutation for inspection, out of the replay order.
  pub fn reject(&self, key: &str, reason: &str) -> Result<bool> {
    let key = key.to_string();
    let Some(entry) = self.store.get_entry(&key)? else {
      return Ok(false);
    };
    let mut mutation = entry.value;
    mutation.rejected = Some(reason.to_string());
    self.store.set(key, mutation, None)?;
    Ok(true)
  }

  pub fn rejected(&self) -> Result<Vec<(String, PendingMutation)>> {
    Ok(
      self
        .entries()?
        .into_iter()
        .filter(|(_, mutation)| mutation.rejected.is_some())
        .collect(),
    )
  }

  /// Mutations awaiting replay.
  pub fn len(&self) -> Result<usize> {
    Ok(self.peek_batch(usize::MAX)?.len())
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  pub fn close(&self) -> Result<()> {
    self.store.close()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn mutation(id: &str) -> PendingMutation {
    PendingMutation::new("notes", id, MutationKind::Update, json!({ "title": id }))
  }

  #[test]
  fn test_fifo_order_and_ack() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = MutationQueue::open(tmp.path(), 100).unwrap();
    for id in ["a", "b", "c"] {
      queue.push(mutation(id)).unwrap();
    }

    let batch = queue.peek_batch(2).unwrap();
    let ids: Vec<&str> = batch.iter().map(|(_, m)| m.entity_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(batch[0].1.queued_at.is_some());

    assert!(queue.ack(&batch[0].0).unwrap());
    assert_eq!(queue.len().unwrap(), 2);
    assert_eq!(queue.peek_batch(1).unwrap()[0].1.entity_id, "b");
  }

  #[test]
  fn test_queue_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    {
      let queue = MutationQueue::open(tmp.path(), 100).unwrap();
      queue.push(mutation("a")).unwrap();
      queue.push(mutation("b")).unwrap();
      queue.close().unwrap();
    }
    let queue = MutationQueue::open(tmp.path(), 100).unwrap();
    assert_eq!(queue.len().unwrap(), 2);
    // New entries sort after the persisted ones
    queue.push(mutation("c")).unwrap();
    let ids: Vec<String> = queue
      .peek_batch(10)
      .unwrap()
      .into_iter()
      .map(|(_, m)| m.entity_id)
      .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
  }

  #[test]
  fn test_full_queue_refuses_instead_of_evicting() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = MutationQueue::open(tmp.path(), 2).unwrap();
    queue.push(mutation("a")).unwrap();
    queue.push(mutation("b")).unwrap();
    let err = queue.push(mutation("c")).unwrap_err();
    assert!(matches!(err, CacheError::CapacityExceeded(_)));
    assert_eq!(queue.len().unwrap(), 2);
  }

  #[test]
  fn test_rejected_mutations_leave_replay_order() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = MutationQueue::open(tmp.path(), 10).unwrap();
    let key = queue.push(mutation("a")).unwrap();
    queue.push(mutation("b")).unwrap();

    assert!(queue.reject(&key, "422 invalid title").unwrap());
    assert_eq!(queue.len().unwrap(), 1);
    let rejected = queue.rejected().unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].1.rejected.as_deref(), Some("422 invalid title"));
    assert!(!queue.reject("missing", "x").unwrap());
  }
}
