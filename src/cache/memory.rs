//! In-process cache tier.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::error::{CacheError, Result};
use super::eviction::EvictionCandidate;
use super::stats::{CacheStats, Counters};
use super::timer::CleanupTimer;
use super::traits::{CacheEvent, CacheKey, CacheStore, Cacheable};
use crate::event::Listeners;

struct State<K, V> {
  entries: HashMap<K, CacheEntry<V>>,
  counters: Counters,
  /// Sum of entry sizes
  memory_usage: u64,
  next_sequence: u64,
  clock: u64,
  closed: bool,
}

impl<K: CacheKey, V: Cacheable> State<K, V> {
  fn tick(&mut self) -> u64 {
    self.clock += 1;
    self.clock
  }

  fn remove_entry(&mut self, key: &K) -> Option<CacheEntry<V>> {
    let entry = self.entries.remove(key)?;
    self.memory_usage = self.memory_usage.saturating_sub(entry.size.unwrap_or(0));
    Some(entry)
  }

  /// Drop every expired entry, returning their keys.
  fn purge_expired(&mut self) -> Vec<K> {
    let now = Utc::now();
    let expired: Vec<K> = self
      .entries
      .iter()
      .filter(|(_, entry)| entry.is_expired_at(now))
      .map(|(key, _)| key.clone())
      .collect();
    for key in &expired {
      self.remove_entry(key);
    }
    self.counters.expired += expired.len() as u64;
    expired
  }

  fn candidates_except(&self, keep: &K) -> Vec<EvictionCandidate<K>> {
    self
      .entries
      .iter()
      .filter(|(key, _)| *key != keep)
      .map(|(key, entry)| EvictionCandidate::from_entry(key.clone(), entry))
      .collect()
  }
}

struct Inner<K, V> {
  config: CacheConfig,
  state: Mutex<State<K, V>>,
  listeners: Listeners<CacheEvent<K>>,
}

impl<K: CacheKey, V: Cacheable> Inner<K, V> {
  fn lock(&self) -> Result<MutexGuard<'_, State<K, V>>> {
    let state = self.state.lock().map_err(CacheError::poisoned)?;
    if state.closed {
      return Err(CacheError::Closed);
    }
    Ok(state)
  }

  fn emit(&self, events: Vec<CacheEvent<K>>) {
    for event in &events {
      self.listeners.emit(event);
    }
  }

  fn cleanup(&self) -> Result<usize> {
    let expired = self.lock()?.purge_expired();
    let count = expired.len();
    if count > 0 {
      debug!(count, "Swept expired memory cache entries");
    }
    self.emit(expired.into_iter().map(CacheEvent::Expire).collect());
    Ok(count)
  }

  /// Evict until both the entry count and the byte budget are satisfied.
  ///
  /// The entry that was just written is never chosen.
  fn enforce_capacity(&self, state: &mut State<K, V>, just_written: &K) -> Vec<K> {
    let policy = self.config.eviction_policy;
    let mut evicted = Vec::new();

    if state.entries.len() > self.config.max_size {
      let candidates = state.candidates_except(just_written);
      // max_size >= 1, so the new entry always fits alongside max_size - 1 others
      evicted.extend(policy.select_keys_to_evict(&candidates, self.config.max_size - 1));
    }
    for key in &evicted {
      state.remove_entry(key);
    }

    if state.memory_usage > self.config.max_memory_size {
      let candidates = state.candidates_except(just_written);
      let overflow = state.memory_usage - self.config.max_memory_size;
      let by_size = policy.select_keys_to_free(&candidates, overflow);
      for key in &by_size {
        state.remove_entry(key);
      }
      evicted.extend(by_size);
    }

    state.counters.evictions += evicted.len() as u64;
    if !evicted.is_empty() {
      debug!(count = evicted.len(), %policy, "Evicted memory cache entries");
    }
    evicted
  }
}

/// Map-backed cache with TTL expiry, capacity enforcement and statistics.
///
/// A single mutex guards all state so every operation is atomic with respect
/// to the others. Events are delivered after the lock is released, so
/// listeners may call back into the cache.
pub struct MemoryCache<K, V> {
  inner: Arc<Inner<K, V>>,
  timer: CleanupTimer,
}

impl<K: CacheKey, V: Cacheable> MemoryCache<K, V> {
  /// Create a memory cache. Fails if the configuration is invalid.
  ///
  /// When called inside a tokio runtime, an expiry sweep runs every
  /// `config.cleanup_interval` until `close()`.
  pub fn new(config: CacheConfig) -> Result<Self> {
    config.validate()?;
    let interval = config.cleanup_interval;
    let inner = Arc::new(Inner {
      config,
      state: Mutex::new(State {
        entries: HashMap::new(),
        counters: Counters::default(),
        memory_usage: 0,
        next_sequence: 0,
        clock: 0,
        closed: false,
      }),
      listeners: Listeners::new(),
    });
    let timer = CleanupTimer::start(interval, Arc::downgrade(&inner), |inner: &Inner<K, V>| {
      if let Err(e) = inner.cleanup() {
        if e != CacheError::Closed {
          warn!(error = %e, "Periodic memory cache cleanup failed");
        }
      }
    });
    Ok(Self { inner, timer })
  }

  pub fn config(&self) -> &CacheConfig {
    &self.inner.config
  }

  /// Whether the periodic sweep is active.
  pub fn has_cleanup_timer(&self) -> bool {
    self.timer.is_running()
  }
}

impl<K: CacheKey> MemoryCache<K, i64> {
  /// Add `amount` to the counter under `key` and return the new value.
  ///
  /// Absent or expired counters start from zero with the default TTL; a live
  /// counter keeps its expiry. The read and the write happen under one lock.
  pub fn increment(&self, key: &K, amount: i64) -> Result<i64> {
    let mut events = vec![CacheEvent::Set(key.clone())];
    let value = {
      let mut state = self.inner.lock()?;
      let now = Utc::now();
      let live = state
        .entries
        .get(key)
        .filter(|entry| !entry.is_expired_at(now))
        .map(|entry| entry.value);
      if live.is_none() && state.remove_entry(key).is_some() {
        state.counters.expired += 1;
      }

      let current = live.unwrap_or(0);
      let value = current.checked_add(amount).ok_or_else(|| {
        CacheError::Storage(format!("counter {:?} overflows at {} + {}", key, current, amount))
      })?;
      let size = serde_json::to_vec(&value)
        .map_err(CacheError::serialization)?
        .len() as u64;

      let tick = state.tick();
      let previous = match state.entries.get_mut(key) {
        Some(entry) => {
          let previous = entry.size.unwrap_or(0);
          entry.value = value;
          entry.size = Some(size);
          entry.touch();
          entry.touched = tick;
          previous
        }
        None => {
          let ttl = self.inner.config.effective_ttl(None);
          let mut entry = CacheEntry::new(value, ttl).with_size(size);
          entry.sequence = state.next_sequence;
          entry.touched = tick;
          state.next_sequence += 1;
          state.entries.insert(key.clone(), entry);
          0
        }
      };
      state.memory_usage = state.memory_usage.saturating_sub(previous) + size;

      let evicted = self.inner.enforce_capacity(&mut state, key);
      events.extend(evicted.into_iter().map(CacheEvent::Evict));
      value
    };
    self.inner.emit(events);
    Ok(value)
  }
}

impl<K: CacheKey, V: Cacheable> CacheStore<K, V> for MemoryCache<K, V> {
  fn get(&self, key: &K) -> Result<Option<V>> {
    let (value, event) = {
      let mut state = self.inner.lock()?;
      let now = Utc::now();
      match state.entries.get(key).map(|entry| entry.is_expired_at(now)) {
        None => {
          state.counters.misses += 1;
          (None, CacheEvent::Miss(key.clone()))
        }
        Some(true) => {
          state.remove_entry(key);
          state.counters.expired += 1;
          state.counters.misses += 1;
          (None, CacheEvent::Miss(key.clone()))
        }
        Some(false) => {
          let tick = state.tick();
          state.counters.hits += 1;
          let value = state.entries.get_mut(key).map(|entry| {
            entry.touch();
            entry.touched = tick;
            entry.value.clone()
          });
          (value, CacheEvent::Hit(key.clone()))
        }
      }
    };
    self.inner.emit(vec![event]);
    Ok(value)
  }

  fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<()> {
    let size = serde_json::to_vec(&value)
      .map_err(CacheError::serialization)?
      .len() as u64;
    if size > self.inner.config.max_memory_size {
      return Err(CacheError::CapacityExceeded(format!(
        "entry of {} bytes exceeds max_memory_size of {} bytes",
        size, self.inner.config.max_memory_size
      )));
    }

    let ttl = self.inner.config.effective_ttl(ttl);
    let mut events = vec![CacheEvent::Set(key.clone())];
    {
      let mut state = self.inner.lock()?;
      let mut entry = CacheEntry::new(value, ttl).with_size(size);
      entry.sequence = state.next_sequence;
      entry.touched = state.tick();
      state.next_sequence += 1;

      state.remove_entry(&key);
      state.entries.insert(key.clone(), entry);
      state.memory_usage += size;

      let evicted = self.inner.enforce_capacity(&mut state, &key);
      events.extend(evicted.into_iter().map(CacheEvent::Evict));
    }
    self.inner.emit(events);
    Ok(())
  }

  fn remove(&self, key: &K) -> Result<bool> {
    let removed = self.inner.lock()?.remove_entry(key).is_some();
    if removed {
      self.inner.emit(vec![CacheEvent::Remove(key.clone())]);
    }
    Ok(removed)
  }

  fn contains_key(&self, key: &K) -> Result<bool> {
    let state = self.inner.lock()?;
    Ok(
      state
        .entries
        .get(key)
        .is_some_and(|entry| !entry.is_expired()),
    )
  }

  fn get_entry(&self, key: &K) -> Result<Option<CacheEntry<V>>> {
    let state = self.inner.lock()?;
    Ok(
      state
        .entries
        .get(key)
        .filter(|entry| !entry.is_expired())
        .cloned(),
    )
  }

  fn peek(&self, key: &K) -> Result<Option<CacheEntry<V>>> {
    Ok(self.inner.lock()?.entries.get(key).cloned())
  }

  fn expire(&self, key: &K, ttl: Option<Duration>) -> Result<bool> {
    let mut state = self.inner.lock()?;
    match state.entries.get_mut(key) {
      Some(entry) if !entry.is_expired() => {
        entry.expire_in(ttl);
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  fn clear(&self) -> Result<()> {
    {
      let mut state = self.inner.lock()?;
      state.entries.clear();
      state.memory_usage = 0;
    }
    self.inner.emit(vec![CacheEvent::Clear]);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<K>> {
    self.inner.cleanup()?;
    Ok(self.inner.lock()?.entries.keys().cloned().collect())
  }

  fn size(&self) -> Result<usize> {
    self.inner.cleanup()?;
    Ok(self.inner.lock()?.entries.len())
  }

  fn cleanup(&self) -> Result<usize> {
    self.inner.cleanup()
  }

  fn stats(&self) -> Result<CacheStats> {
    self.inner.cleanup()?;
    let state = self.inner.lock()?;
    Ok(
      state
        .counters
        .snapshot(state.entries.len(), state.memory_usage, 0),
    )
  }

  fn close(&self) -> Result<()> {
    self.timer.stop();
    let mut state = self.inner.state.lock().map_err(CacheError::poisoned)?;
    state.entries.clear();
    state.memory_usage = 0;
    state.closed = true;
    Ok(())
  }

  fn listeners(&self) -> &Listeners<CacheEvent<K>> {
    &self.inner.listeners
  }
}
