//! Persistent cache tier.
//!
//! Layout of the cache directory:
//!
//! ```text
//! <dir>/index.json          hashed key -> entry metadata (source of truth)
//! <dir>/<sha256>.cache      one encoded value per entry
//! ```
//!
//! The index is rewritten in full after every mutation and reloaded at open.
//! Index records whose file has disappeared are dropped silently, both at open
//! and when a lookup or `keys()` notices the gap; files nobody references are
//! deleted at open.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::codec::ValueCodec;
use super::config::CacheConfig;
use super::entry::{deadline, CacheEntry};
use super::error::{CacheError, Result};
use super::eviction::EvictionCandidate;
use super::stats::{CacheStats, Counters};
use super::timer::CleanupTimer;
use super::traits::{CacheEvent, CacheKey, CacheStore, Cacheable};
use crate::event::Listeners;

const INDEX_FILE: &str = "index.json";
const ENTRY_EXTENSION: &str = "cache";
const INDEX_VERSION: u32 = 1;

/// Fraction of `max_disk_size` to shrink to once the limit is exceeded.
const DISK_HEADROOM_TARGET: f64 = 0.8;

/// Metadata for one entry, as persisted in the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRecord {
  /// The logical key, serialized
  key: serde_json::Value,
  file_name: String,
  created_at: DateTime<Utc>,
  expires_at: Option<DateTime<Utc>>,
  last_access_time: Option<DateTime<Utc>>,
  access_count: u64,
  size: u64,
  sequence: u64,
  touched: u64,
}

impl IndexRecord {
  fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|expires_at| now > expires_at)
  }

  fn candidate(&self, hash: &str) -> EvictionCandidate<String> {
    EvictionCandidate {
      key: hash.to_string(),
      created_at: self.created_at,
      last_access_time: self.last_access_time,
      access_count: self.access_count,
      size: self.size,
      sequence: self.sequence,
      touched: self.touched,
    }
  }

  fn to_entry<V>(&self, value: V) -> CacheEntry<V> {
    let mut entry = CacheEntry::new(value, None).with_size(self.size);
    entry.created_at = self.created_at;
    entry.expires_at = self.expires_at;
    entry.last_access_time = self.last_access_time;
    entry.access_count = self.access_count;
    entry.sequence = self.sequence;
    entry.touched = self.touched;
    entry
  }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
  version: u32,
  next_sequence: u64,
  clock: u64,
  entries: BTreeMap<String, IndexRecord>,
}

struct State {
  index: IndexFile,
  disk_usage: u64,
  counters: Counters,
  closed: bool,
}

impl State {
  fn tick(&mut self) -> u64 {
    self.index.clock += 1;
    self.index.clock
  }

  fn remove_record(&mut self, hash: &str) -> Option<IndexRecord> {
    let record = self.index.entries.remove(hash)?;
    self.disk_usage = self.disk_usage.saturating_sub(record.size);
    Some(record)
  }

  fn candidates_except(&self, keep: &str) -> Vec<EvictionCandidate<String>> {
    self
      .index
      .entries
      .iter()
      .filter(|(hash, _)| hash.as_str() != keep)
      .map(|(hash, record)| record.candidate(hash))
      .collect()
  }
}

struct Inner<K, V> {
  dir: PathBuf,
  config: CacheConfig,
  codec: ValueCodec,
  state: Mutex<State>,
  listeners: Listeners<CacheEvent<K>>,
  _marker: PhantomData<fn() -> V>,
}

impl<K: CacheKey, V: Cacheable> Inner<K, V> {
  fn lock(&self) -> Result<MutexGuard<'_, State>> {
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

  fn hash_key(&self, key: &K) -> Result<String> {
    let serialized = serde_json::to_string(key).map_err(CacheError::serialization)?;
    let mut hasher = Sha256::new();
    hasher.update(self.config.key_prefix.as_bytes());
    hasher.update(serialized.as_bytes());
    Ok(hex::encode(hasher.finalize()))
  }

  fn entry_path(&self, file_name: &str) -> PathBuf {
    self.dir.join(file_name)
  }

  fn decode_key(record: &IndexRecord) -> Result<K> {
    serde_json::from_value(record.key.clone()).map_err(CacheError::deserialization)
  }

  fn delete_file(&self, file_name: &str) -> Result<()> {
    match fs::remove_file(self.entry_path(file_name)) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(CacheError::Storage(format!(
        "Failed to delete cache file {}: {}",
        file_name, e
      ))),
    }
  }

  fn persist(&self, state: &State) -> Result<()> {
    write_index(&self.dir, &state.index)
  }

  /// Remove expired records and records whose file is gone.
  ///
  /// Returns the keys of expired entries, for events.
  fn purge_stale(&self, state: &mut State) -> Result<Vec<K>> {
    let now = Utc::now();
    let mut expired = Vec::new();
    let mut missing = Vec::new();
    for (hash, record) in &state.index.entries {
      if record.is_expired_at(now) {
        expired.push(hash.clone());
      } else if !self.entry_path(&record.file_name).exists() {
        missing.push(hash.clone());
      }
    }

    let mut expired_keys = Vec::with_capacity(expired.len());
    for hash in &expired {
      if let Some(record) = state.remove_record(hash) {
        self.delete_file(&record.file_name)?;
        if let Ok(key) = Self::decode_key(&record) {
          expired_keys.push(key);
        }
      }
    }
    for hash in &missing {
      warn!(hash = %hash, "Cache file missing, dropping index entry");
      state.remove_record(hash);
    }
    state.counters.expired += expired.len() as u64;

    if !expired.is_empty() || !missing.is_empty() {
      self.persist(state)?;
    }
    Ok(expired_keys)
  }

  fn cleanup(&self) -> Result<usize> {
    let expired = {
      let mut state = self.lock()?;
      self.purge_stale(&mut state)?
    };
    let count = expired.len();
    if count > 0 {
      debug!(count, dir = %self.dir.display(), "Swept expired disk cache entries");
    }
    self.emit(expired.into_iter().map(CacheEvent::Expire).collect());
    Ok(count)
  }

  /// Evict by entry count first, then by aggregate size.
  ///
  /// Once `max_disk_size` is exceeded, entries go until usage is back under
  /// the headroom target. The record just written is never chosen.
  fn enforce_capacity(&self, state: &mut State, just_written: &str) -> Result<Vec<K>> {
    let policy = self.config.eviction_policy;
    let mut victims = Vec::new();

    if state.index.entries.len() > self.config.max_size {
      let candidates = state.candidates_except(just_written);
      victims.extend(policy.select_keys_to_evict(&candidates, self.config.max_size - 1));
    }

    let mut evicted_records = Vec::new();
    for hash in &victims {
      if let Some(record) = state.remove_record(hash) {
        evicted_records.push(record);
      }
    }

    if state.disk_usage > self.config.max_disk_size {
      let target = (self.config.max_disk_size as f64 * DISK_HEADROOM_TARGET) as u64;
      let to_free = state.disk_usage - target;
      let candidates = state.candidates_except(just_written);
      for hash in policy.select_keys_to_free(&candidates, to_free) {
        if let Some(record) = state.remove_record(&hash) {
          evicted_records.push(record);
        }
      }
    }

    state.counters.evictions += evicted_records.len() as u64;
    let mut keys = Vec::with_capacity(evicted_records.len());
    for record in &evicted_records {
      self.delete_file(&record.file_name)?;
      if let Ok(key) = Self::decode_key(record) {
        keys.push(key);
      }
    }
    if !keys.is_empty() {
      debug!(count = keys.len(), %policy, "Evicted disk cache entries");
    }
    Ok(keys)
  }

  /// Read and decode an entry's value, or None if its file is gone.
  fn read_value(&self, record: &IndexRecord) -> Result<Option<V>> {
    match fs::read(self.entry_path(&record.file_name)) {
      Ok(bytes) => self.codec.decode(bytes).map(Some),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(CacheError::Storage(format!(
        "Failed to read cache file {}: {}",
        record.file_name, e
      ))),
    }
  }
}

/// Write `bytes` to `path` via a temporary file and a rename, so readers
/// never observe a half-written file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
  let mut tmp = path.as_os_str().to_owned();
  tmp.push(".tmp");
  let tmp = PathBuf::from(tmp);
  fs::write(&tmp, bytes)
    .map_err(|e| CacheError::Storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
  fs::rename(&tmp, path)
    .map_err(|e| CacheError::Storage(format!("Failed to replace {}: {}", path.display(), e)))?;
  Ok(())
}

fn write_index(dir: &Path, index: &IndexFile) -> Result<()> {
  let bytes = serde_json::to_vec(index).map_err(CacheError::serialization)?;
  write_atomic(&dir.join(INDEX_FILE), &bytes)
}

/// Load the index, dropping records whose file is missing and deleting
/// files no record points to.
fn load_index(dir: &Path) -> Result<IndexFile> {
  let path = dir.join(INDEX_FILE);
  let mut index = match fs::read(&path) {
    Ok(bytes) => match serde_json::from_slice::<IndexFile>(&bytes) {
      Ok(index) => index,
      Err(e) => {
        warn!(path = %path.display(), error = %e, "Cache index unreadable, starting empty");
        IndexFile::default()
      }
    },
    Err(e) if e.kind() == ErrorKind::NotFound => IndexFile::default(),
    Err(e) => {
      return Err(CacheError::Storage(format!(
        "Failed to read cache index {}: {}",
        path.display(),
        e
      )))
    }
  };
  index.version = INDEX_VERSION;

  let before = index.entries.len();
  index
    .entries
    .retain(|_, record| dir.join(&record.file_name).exists());
  let dropped = before - index.entries.len();

  let referenced: HashSet<&str> = index
    .entries
    .values()
    .map(|record| record.file_name.as_str())
    .collect();
  let mut orphans = 0;
  for dir_entry in fs::read_dir(dir)? {
    let path = dir_entry?.path();
    let is_entry_file = path
      .extension()
      .is_some_and(|ext| ext == ENTRY_EXTENSION);
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if is_entry_file && !referenced.contains(name) {
      fs::remove_file(&path)?;
      orphans += 1;
    }
  }

  if dropped > 0 || orphans > 0 {
    warn!(
      dropped,
      orphans,
      dir = %dir.display(),
      "Repaired cache index on load"
    );
    write_index(dir, &index)?;
  }
  Ok(index)
}

/// Cache that survives process restarts: one file per entry plus a JSON index.
///
/// All operations on one instance are serialized by a single mutex, which also
/// prevents lost updates on the index file. Two instances must not share a
/// directory.
pub struct DiskCache<K, V> {
  inner: Arc<Inner<K, V>>,
  timer: CleanupTimer,
}

impl<K: CacheKey, V: Cacheable> DiskCache<K, V> {
  /// Open (or create) a disk cache rooted at `dir`.
  pub fn open(dir: impl Into<PathBuf>, config: CacheConfig) -> Result<Self> {
    config.validate()?;
    let dir = dir.into();
    fs::create_dir_all(&dir).map_err(|e| {
      CacheError::Storage(format!(
        "Failed to create cache directory {}: {}",
        dir.display(),
        e
      ))
    })?;

    let index = load_index(&dir)?;
    let disk_usage = index.entries.values().map(|record| record.size).sum();
    info!(
      dir = %dir.display(),
      entries = index.entries.len(),
      disk_usage,
      "Opened disk cache"
    );

    let interval = config.cleanup_interval;
    let inner = Arc::new(Inner {
      codec: ValueCodec::from_config(&config),
      dir,
      config,
      state: Mutex::new(State {
        index,
        disk_usage,
        counters: Counters::default(),
        closed: false,
      }),
      listeners: Listeners::new(),
      _marker: PhantomData,
    });
    let timer = CleanupTimer::start(interval, Arc::downgrade(&inner), |inner: &Inner<K, V>| {
      if let Err(e) = inner.cleanup() {
        if e != CacheError::Closed {
          warn!(error = %e, "Periodic disk cache cleanup failed");
        }
      }
    });
    Ok(Self { inner, timer })
  }

  pub fn dir(&self) -> &Path {
    &self.inner.dir
  }

  pub fn config(&self) -> &CacheConfig {
    &self.inner.config
  }

  pub fn has_cleanup_timer(&self) -> bool {
    self.timer.is_running()
  }

  /// Whether `close()` has been called.
  pub fn is_disposed(&self) -> bool {
    self.inner.state.lock().map(|s| s.closed).unwrap_or(true)
  }
}

impl<K: CacheKey, V: Cacheable> CacheStore<K, V> for DiskCache<K, V> {
  fn get(&self, key: &K) -> Result<Option<V>> {
    let hash = self.inner.hash_key(key)?;
    let (value, event) = {
      let mut state = self.inner.lock()?;
      let Some(record) = state.index.entries.get(&hash).cloned() else {
        state.counters.misses += 1;
        drop(state);
        self.inner.emit(vec![CacheEvent::Miss(key.clone())]);
        return Ok(None);
      };

      if record.is_expired_at(Utc::now()) {
        state.remove_record(&hash);
        self.inner.delete_file(&record.file_name)?;
        state.counters.expired += 1;
        state.counters.misses += 1;
        self.inner.persist(&state)?;
        (None, CacheEvent::Miss(key.clone()))
      } else {
        match self.inner.read_value(&record)? {
          None => {
            warn!(key = ?key, "Cache file missing, dropping index entry");
            state.remove_record(&hash);
            state.counters.misses += 1;
            self.inner.persist(&state)?;
            (None, CacheEvent::Miss(key.clone()))
          }
          Some(value) => {
            let tick = state.tick();
            if let Some(record) = state.index.entries.get_mut(&hash) {
              record.last_access_time = Some(Utc::now());
              record.access_count += 1;
              record.touched = tick;
            }
            state.counters.hits += 1;
            self.inner.persist(&state)?;
            (Some(value), CacheEvent::Hit(key.clone()))
          }
        }
      }
    };
    self.inner.emit(vec![event]);
    Ok(value)
  }

  fn set(&self, key: K, value: V, ttl: Option<Duration>) -> Result<()> {
    let bytes = self.inner.codec.encode(&value)?;
    let size = bytes.len() as u64;
    if size > self.inner.config.max_disk_size {
      return Err(CacheError::CapacityExceeded(format!(
        "entry of {} bytes exceeds max_disk_size of {} bytes",
        size, self.inner.config.max_disk_size
      )));
    }
    let hash = self.inner.hash_key(&key)?;
    let serialized_key = serde_json::to_value(&key).map_err(CacheError::serialization)?;
    let file_name = format!("{}.{}", hash, ENTRY_EXTENSION);
    let ttl = self.inner.config.effective_ttl(ttl);

    let mut events = vec![CacheEvent::Set(key)];
    {
      let mut state = self.inner.lock()?;
      write_atomic(&self.inner.entry_path(&file_name), &bytes)?;

      let now = Utc::now();
      let sequence = state.index.next_sequence;
      state.index.next_sequence += 1;
      let touched = state.tick();
      state.remove_record(&hash);
      state.index.entries.insert(
        hash.clone(),
        IndexRecord {
          key: serialized_key,
          file_name,
          created_at: now,
          expires_at: ttl.and_then(|ttl| deadline(now, ttl)),
          last_access_time: None,
          access_count: 0,
          size,
          sequence,
          touched,
        },
      );
      state.disk_usage += size;

      let evicted = self.inner.enforce_capacity(&mut state, &hash)?;
      events.extend(evicted.into_iter().map(CacheEvent::Evict));
      self.inner.persist(&state)?;
    }
    self.inner.emit(events);
    Ok(())
  }

  fn remove(&self, key: &K) -> Result<bool> {
    let hash = self.inner.hash_key(key)?;
    let removed = {
      let mut state = self.inner.lock()?;
      match state.remove_record(&hash) {
        Some(record) => {
          self.inner.delete_file(&record.file_name)?;
          self.inner.persist(&state)?;
          true
        }
        None => false,
      }
    };
    if removed {
      self.inner.emit(vec![CacheEvent::Remove(key.clone())]);
    }
    Ok(removed)
  }

  fn contains_key(&self, key: &K) -> Result<bool> {
    let hash = self.inner.hash_key(key)?;
    let state = self.inner.lock()?;
    Ok(state.index.entries.get(&hash).is_some_and(|record| {
      !record.is_expired_at(Utc::now()) && self.inner.entry_path(&record.file_name).exists()
    }))
  }

  fn get_entry(&self, key: &K) -> Result<Option<CacheEntry<V>>> {
    Ok(
      self
        .peek(key)?
        .filter(|entry| !entry.is_expired()),
    )
  }

  fn peek(&self, key: &K) -> Result<Option<CacheEntry<V>>> {
    let hash = self.inner.hash_key(key)?;
    let state = self.inner.lock()?;
    let Some(record) = state.index.entries.get(&hash) else {
      return Ok(None);
    };
    Ok(
      self
        .inner
        .read_value(record)?
        .map(|value| record.to_entry(value)),
    )
  }

  fn expire(&self, key: &K, ttl: Option<Duration>) -> Result<bool> {
    let hash = self.inner.hash_key(key)?;
    let mut state = self.inner.lock()?;
    let now = Utc::now();
    match state.index.entries.get_mut(&hash) {
      Some(record) if !record.is_expired_at(now) => {
        record.expires_at = ttl.and_then(|ttl| deadline(now, ttl));
      }
      _ => return Ok(false),
    }
    self.inner.persist(&state)?;
    Ok(true)
  }

  fn clear(&self) -> Result<()> {
    {
      let mut state = self.inner.lock()?;
      let records: Vec<IndexRecord> = std::mem::take(&mut state.index.entries)
        .into_values()
        .collect();
      state.disk_usage = 0;
      for record in &records {
        self.inner.delete_file(&record.file_name)?;
      }
      self.inner.persist(&state)?;
    }
    self.inner.emit(vec![CacheEvent::Clear]);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<K>> {
    let (expired, keys) = {
      let mut state = self.inner.lock()?;
      let expired = self.inner.purge_stale(&mut state)?;
      let keys = state
        .index
        .entries
        .values()
        .map(Inner::<K, V>::decode_key)
        .collect::<Result<Vec<K>>>()?;
      (expired, keys)
    };
    self.inner.emit(expired.into_iter().map(CacheEvent::Expire).collect());
    Ok(keys)
  }

  fn size(&self) -> Result<usize> {
    let (expired, size) = {
      let mut state = self.inner.lock()?;
      let expired = self.inner.purge_stale(&mut state)?;
      (expired, state.index.entries.len())
    };
    self.inner.emit(expired.into_iter().map(CacheEvent::Expire).collect());
    Ok(size)
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
        .snapshot(state.index.entries.len(), 0, state.disk_usage),
    )
  }

  fn close(&self) -> Result<()> {
    self.timer.stop();
    let mut state = self.inner.state.lock().map_err(CacheError::poisoned)?;
    if state.closed {
      return Ok(());
    }
    self.inner.persist(&state)?;
    state.closed = true;
    info!(dir = %self.inner.dir.display(), "Closed disk cache");
    Ok(())
  }

  fn listeners(&self) -> &Listeners<CacheEvent<K>> {
    &self.inner.listeners
  }
}
