//! The unit stored by both cache tiers.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

/// A cached value together with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
  /// The cached value
  pub value: V,
  /// When the entry was inserted
  pub created_at: DateTime<Utc>,
  /// When the entry stops being served (None = never)
  pub expires_at: Option<DateTime<Utc>>,
  /// Last successful read
  pub last_access_time: Option<DateTime<Utc>>,
  /// Number of successful reads
  pub access_count: u64,
  /// Serialized byte length of the value, when known
  pub size: Option<u64>,
  /// Free-form metadata attached by callers
  pub metadata: HashMap<String, serde_json::Value>,
  /// Insertion sequence number, the eviction tie-break
  pub(crate) sequence: u64,
  /// Logical clock value of the last write or read
  pub(crate) touched: u64,
}

impl<V> CacheEntry<V> {
  /// Create a new entry expiring `ttl` from now (None = never expires).
  pub fn new(value: V, ttl: Option<Duration>) -> Self {
    let now = Utc::now();
    Self {
      value,
      created_at: now,
      expires_at: ttl.and_then(|ttl| deadline(now, ttl)),
      last_access_time: None,
      access_count: 0,
      size: None,
      metadata: HashMap::new(),
      sequence: 0,
      touched: 0,
    }
  }

  /// Set the serialized size.
  pub fn with_size(mut self, size: u64) -> Self {
    self.size = Some(size);
    self
  }

  /// Whether the entry is expired at `now`.
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|expires_at| now > expires_at)
  }

  /// Whether the entry is expired right now.
  pub fn is_expired(&self) -> bool {
    self.is_expired_at(Utc::now())
  }

  /// Record a read.
  pub fn touch(&mut self) {
    self.last_access_time = Some(Utc::now());
    self.access_count += 1;
  }

  /// Remaining lifetime, or None if the entry never expires.
  pub fn time_to_live(&self) -> Option<Duration> {
    self
      .expires_at
      .map(|expires_at| (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
  }

  /// Reset the expiry to `ttl` from now.
  pub fn expire_in(&mut self, ttl: Option<Duration>) {
    self.expires_at = ttl.and_then(|ttl| deadline(Utc::now(), ttl));
  }

  /// The timestamp LRU ordering uses: the later of creation and last access.
  pub fn recency(&self) -> DateTime<Utc> {
    match self.last_access_time {
      Some(accessed) if accessed > self.created_at => accessed,
      _ => self.created_at,
    }
  }
}

/// `from + ttl`, or None when the sum is not representable (treated as no expiry).
pub(crate) fn deadline(from: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
  from.checked_add_signed(chrono::Duration::from_std(ttl).ok()?)
}
