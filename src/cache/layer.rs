//! Cache layer that combines the memory and disk tiers according to a
//! `CacheStrategy`, with cache-first fetching and offline fallback.

use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::config::{CacheConfig, CacheStrategy};
use super::disk::DiskCache;
use super::entry::CacheEntry;
use super::error::{CacheError, Result};
use super::memory::MemoryCache;
use super::stats::CacheStats;
use super::traits::{CacheKey, CacheResult, CacheSource, CacheStore, Cacheable};

/// Failure of `CacheLayer::fetch`.
#[derive(Error, Debug)]
pub enum FetchError<E> {
  #[error(transparent)]
  Cache(#[from] CacheError),

  /// The fetcher failed and no cached copy (fresh or stale) was available
  #[error("Fetch failed and nothing cached: {0}")]
  Fetch(E),
}

/// Per-tier statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LayerStats {
  pub memory: Option<CacheStats>,
  pub disk: Option<CacheStats>,
}

/// Cache layer that routes reads and writes across the tiers.
///
/// This layer sits between the application and the remote service: reads go
/// memory first, then disk; on a full miss `fetch` calls the network and, if
/// that fails, serves an expired copy rather than nothing.
pub struct CacheLayer<K, V> {
  strategy: CacheStrategy,
  memory: Option<Arc<MemoryCache<K, V>>>,
  disk: Option<Arc<DiskCache<K, V>>>,
  /// Serializes read-modify-write operations that span tiers
  update: Mutex<()>,
}

impl<K: CacheKey, V: Cacheable> CacheLayer<K, V> {
  /// Build the tiers `config.strategy` calls for.
  ///
  /// `disk_dir` is required for every strategy that uses the disk tier.
  pub fn open(config: CacheConfig, disk_dir: Option<PathBuf>) -> Result<Self> {
    config.validate()?;
    let strategy = config.strategy;

    let disk = if strategy.uses_disk() {
      let dir = disk_dir.ok_or_else(|| {
        CacheError::config(format!("strategy {:?} needs a cache directory", strategy))
      })?;
      Some(Arc::new(DiskCache::open(dir, config.clone())?))
    } else {
      None
    };
    let memory = if strategy.uses_memory() {
      Some(Arc::new(MemoryCache::new(config)?))
    } else {
      None
    };

    Ok(Self {
      strategy,
      memory,
      disk,
      update: Mutex::new(()),
    })
  }

  pub fn strategy(&self) -> CacheStrategy {
    self.strategy
  }

  pub fn memory(&self) -> Option<&Arc<MemoryCache<K, V>>> {
    self.memory.as_ref()
  }

  pub fn disk(&self) -> Option<&Arc<DiskCache<K, V>>> {
    self.disk.as_ref()
  }

  /// Read through the tiers. Returns the value and the tier that served it.
  pub fn get_with_source(&self, key: &K) -> Result<Option<(V, CacheSource)>> {
    if let Some(memory) = &self.memory {
      if let Some(value) = memory.get(key)? {
        return Ok(Some((value, CacheSource::Memory)));
      }
    }
    let Some(disk) = &self.disk else {
      return Ok(None);
    };
    let Some(value) = disk.get(key)? else {
      return Ok(None);
    };

    if self.strategy == CacheStrategy::Tiered {
      if let Some(memory) = &self.memory {
        // Promote with whatever lifetime the disk copy has left
        let ttl = disk.get_entry(key)?.and_then(|entry| entry.time_to_live());
        if Self::fill_memory(memory, key.clone(), value.clone(), ttl)? {
          debug!(key = ?key, "Promoted disk cache entry into memory");
        }
      }
    }
    Ok(Some((value, CacheSource::Disk)))
  }

  /// Copy a value that is already on disk into the memory tier.
  ///
  /// Values over the memory budget stay disk-only; any older memory copy is
  /// dropped so it cannot shadow the disk value. Returns whether it was stored.
  fn fill_memory(
    memory: &MemoryCache<K, V>,
    key: K,
    value: V,
    ttl: Option<Duration>,
  ) -> Result<bool> {
    match memory.set(key.clone(), value, ttl) {
      Ok(()) => Ok(true),
      Err(CacheError::CapacityExceeded(reason)) => {
        debug!(key = ?key, reason = %reason, "Entry kept on disk only");
        memory.remove(&key)?;
        Ok(false)
      }
      Err(e) => Err(e),
    }
  }

  pub fn get(&self, key: &K) -> Result<Option<V>> {
    Ok(self.get_with_source(key)?.map(|(value, _)| value))
  }

  /// Write to every tier the strategy uses.
  ///
  /// With a disk tier the write succeeds once it is on disk; the memory copy
  /// is skipped for values larger than the memory budget.
  pub fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<()> {
    match (&self.memory, &self.disk) {
      (Some(memory), Some(disk)) => {
        disk.set(key.clone(), value.clone(), ttl)?;
        Self::fill_memory(memory, key, value, ttl)?;
      }
      (Some(memory), None) => memory.set(key, value, ttl)?,
      (None, Some(disk)) => disk.set(key, value, ttl)?,
      (None, None) => {}
    }
    Ok(())
  }

  pub fn remove(&self, key: &K) -> Result<bool> {
    let mut removed = false;
    if let Some(memory) = &self.memory {
      removed |= memory.remove(key)?;
    }
    if let Some(disk) = &self.disk {
      removed |= disk.remove(key)?;
    }
    Ok(removed)
  }

  pub fn contains_key(&self, key: &K) -> Result<bool> {
    if let Some(memory) = &self.memory {
      if memory.contains_key(key)? {
        return Ok(true);
      }
    }
    match &self.disk {
      Some(disk) => disk.contains_key(key),
      None => Ok(false),
    }
  }

  /// Live keys across both tiers, without duplicates.
  pub fn keys(&self) -> Result<Vec<K>> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    let memory_keys = match &self.memory {
      Some(memory) => memory.keys()?,
      None => Vec::new(),
    };
    let disk_keys = match &self.disk {
      Some(disk) => disk.keys()?,
      None => Vec::new(),
    };
    for key in memory_keys.into_iter().chain(disk_keys) {
      if seen.insert(key.clone()) {
        keys.push(key);
      }
    }
    Ok(keys)
  }

  pub fn clear(&self) -> Result<()> {
    if let Some(memory) = &self.memory {
      memory.clear()?;
    }
    if let Some(disk) = &self.disk {
      disk.clear()?;
    }
    Ok(())
  }

  /// Sweep expired entries from both tiers.
  pub fn cleanup(&self) -> Result<usize> {
    let mut removed = 0;
    if let Some(memory) = &self.memory {
      removed += memory.cleanup()?;
    }
    if let Some(disk) = &self.disk {
      removed += disk.cleanup()?;
    }
    Ok(removed)
  }

  pub fn stats(&self) -> Result<LayerStats> {
    Ok(LayerStats {
      memory: self.memory.as_ref().map(|m| m.stats()).transpose()?,
      disk: self.disk.as_ref().map(|d| d.stats()).transpose()?,
    })
  }

  pub fn close(&self) -> Result<()> {
    if let Some(memory) = &self.memory {
      memory.close()?;
    }
    if let Some(disk) = &self.disk {
      disk.close()?;
    }
    Ok(())
  }

  /// Newest copy of an entry in any tier, expired or not.
  fn peek(&self, key: &K) -> Result<Option<CacheEntry<V>>> {
    if let Some(memory) = &self.memory {
      if let Some(entry) = memory.peek(key)? {
        return Ok(Some(entry));
      }
    }
    match &self.disk {
      Some(disk) => disk.peek(key),
      None => Ok(None),
    }
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Live entry in a tier - return it
  /// 2. Otherwise call the fetcher and store its result
  /// 3. On fetcher failure, return the expired copy if one exists (offline mode)
  pub async fn fetch<F, Fut, E>(
    &self,
    key: &K,
    fetcher: F,
  ) -> std::result::Result<CacheResult<V>, FetchError<E>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<V, E>>,
    E: std::fmt::Display,
  {
    // Grab any stale copy before a lookup purges it
    let stale = self.peek(key)?;

    if let Some((value, source)) = self.get_with_source(key)? {
      let cached_at = stale
        .as_ref()
        .map(|entry| entry.created_at)
        .unwrap_or_else(chrono::Utc::now);
      return Ok(CacheResult::from_cache(value, source, cached_at));
    }

    match fetcher().await {
      Ok(data) => {
        self.set(key.clone(), data.clone(), None)?;
        Ok(CacheResult::from_network(data))
      }
      Err(e) => match stale {
        Some(entry) => {
          warn!(key = ?key, error = %e, "Fetch failed, serving expired cache entry");
          Ok(CacheResult::offline(entry.value, entry.created_at))
        }
        None => Err(FetchError::Fetch(e)),
      },
    }
  }
}

impl<K: CacheKey> CacheLayer<K, i64> {
  /// Add `amount` to the counter under `key` and return the new value.
  ///
  /// A memory-only layer updates in place under the cache lock. With a disk
  /// tier, increments through this layer are serialized against each other
  /// and the counter keeps whatever lifetime it had left.
  pub fn increment(&self, key: &K, amount: i64) -> Result<i64> {
    if let (Some(memory), None) = (&self.memory, &self.disk) {
      return memory.increment(key, amount);
    }

    let _guard = self.update.lock().map_err(CacheError::poisoned)?;
    let live = match self.memory.as_ref().map(|m| m.get_entry(key)).transpose()?.flatten() {
      Some(entry) => Some(entry),
      None => self.disk.as_ref().map(|d| d.get_entry(key)).transpose()?.flatten(),
    };
    let (current, ttl) = match &live {
      Some(entry) => (entry.value, entry.time_to_live()),
      None => (0, None),
    };
    let value = current.checked_add(amount).ok_or_else(|| {
      CacheError::Storage(format!("counter {:?} overflows at {} + {}", key, current, amount))
    })?;
    self.set(key.clone(), value, ttl)?;
    Ok(value)
  }
}
