//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use super::entry::CacheEntry;
use super::error::Result;
use super::stats::CacheStats;
use crate::event::Listeners;

/// Bound for cache keys.
///
/// Keys must serialize so the disk tier can hash them into file names and
/// record them in its index.
pub trait CacheKey:
  Clone + Eq + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> CacheKey for T where
  T: Clone + Eq + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Bound for cached values.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Events emitted by a cache instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent<K> {
  Hit(K),
  Miss(K),
  Set(K),
  Remove(K),
  /// Removed to satisfy a capacity limit
  Evict(K),
  /// Removed by an expiry sweep
  Expire(K),
  Clear,
}

/// Operations shared by the memory and disk tiers.
///
/// Every method serializes against the instance's own state; there is no
/// locking across instances.
pub trait CacheStore<K: CacheKey, V: Cacheable>: Send + Sync {
  /// Look up a value. Expired entries are removed and reported as a miss.
  fn get(&self, key: &K) -> Result<Option<V>>;

  /// Insert or replace a value. `None` uses the configured default TTL.
  fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<()>;

  /// Remove a key. Returns whether it was present.
  fn remove(&self, key: &K) -> Result<bool>;

  /// Whether a live (non-expired) entry exists. Not counted as an access.
  fn contains_key(&self, key: &K) -> Result<bool>;

  /// Full live entry with metadata. Not counted as an access.
  fn get_entry(&self, key: &K) -> Result<Option<CacheEntry<V>>>;

  /// Entry even if it has expired, without purging it or counting an access.
  fn peek(&self, key: &K) -> Result<Option<CacheEntry<V>>>;

  /// Reset the TTL of an existing entry. Returns false if the key is absent.
  fn expire(&self, key: &K, ttl: Option<Duration>) -> Result<bool>;

  /// Remove every entry.
  fn clear(&self) -> Result<()>;

  /// Live keys, after purging expired entries.
  fn keys(&self) -> Result<Vec<K>>;

  /// Number of live entries, after purging expired entries.
  fn size(&self) -> Result<usize>;

  /// Remove expired entries, returning how many were removed.
  fn cleanup(&self) -> Result<usize>;

  /// Statistics snapshot; runs `cleanup` first.
  fn stats(&self) -> Result<CacheStats>;

  /// Stop the cleanup timer and refuse further use.
  fn close(&self) -> Result<()>;

  /// Listener registry for this instance's events.
  fn listeners(&self) -> &Listeners<CacheEvent<K>>;

  /// Look up several keys. Absent and expired keys are left out of the map.
  fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>> {
    let mut found = HashMap::with_capacity(keys.len());
    for key in keys {
      if let Some(value) = self.get(key)? {
        found.insert(key.clone(), value);
      }
    }
    Ok(found)
  }

  /// Insert several values, one at a time.
  ///
  /// Not atomic: if an insert fails, the entries before it stay applied.
  fn set_all(&self, entries: Vec<(K, V)>, ttl: Option<Duration>) -> Result<()> {
    for (key, value) in entries {
      self.set(key, value, ttl)?;
    }
    Ok(())
  }

  /// Remove several keys, returning how many were present.
  fn remove_all(&self, keys: &[K]) -> Result<usize> {
    let mut removed = 0;
    for key in keys {
      if self.remove(key)? {
        removed += 1;
      }
    }
    Ok(removed)
  }
}

/// Result from a cache-layer fetch, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a cache tier.
  pub fn from_cache(data: T, source: CacheSource, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where fetched data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Live entry from the memory tier
  Memory,
  /// Live entry from the disk tier
  Disk,
  /// Network unavailable, serving an expired copy
  Offline,
}
