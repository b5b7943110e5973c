//! Cache configuration and its construction-time validation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{CacheError, Result};
use super::eviction::EvictionPolicy;

/// Which tiers a `CacheLayer` reads from and writes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStrategy {
  /// Memory tier only
  MemoryOnly,
  /// Disk tier only
  DiskOnly,
  /// Every write is mirrored to disk; memory misses read the disk copy
  /// without promoting it
  MemoryWithDiskBackup,
  /// Memory in front of disk; disk hits are promoted into memory
  #[default]
  Tiered,
}

impl CacheStrategy {
  pub fn uses_memory(&self) -> bool {
    !matches!(self, CacheStrategy::DiskOnly)
  }

  pub fn uses_disk(&self) -> bool {
    !matches!(self, CacheStrategy::MemoryOnly)
  }
}

/// Cache configuration.
///
/// Build one with `CacheConfig::default()` plus struct update syntax, then
/// hand it to a cache constructor which calls `validate()`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
  pub strategy: CacheStrategy,
  pub eviction_policy: EvictionPolicy,
  /// Maximum number of entries per tier
  pub max_size: usize,
  /// Maximum aggregate serialized bytes held in memory
  pub max_memory_size: u64,
  /// Maximum aggregate bytes held on disk
  pub max_disk_size: u64,
  /// TTL applied when `set` is called without one. Zero means no expiry.
  pub default_ttl: Duration,
  /// Period of the background expiry sweep. Zero disables the timer.
  pub cleanup_interval: Duration,
  /// Accepted for compatibility; values are stored uncompressed.
  pub enable_compression: bool,
  /// Accepted for compatibility; values are stored in the clear.
  pub enable_encryption: bool,
  /// Namespace mixed into on-disk file names
  pub key_prefix: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      strategy: CacheStrategy::default(),
      eviction_policy: EvictionPolicy::default(),
      max_size: 1000,
      max_memory_size: 50 * 1024 * 1024,
      max_disk_size: 200 * 1024 * 1024,
      default_ttl: Duration::from_secs(60 * 60),
      cleanup_interval: Duration::from_secs(5 * 60),
      enable_compression: false,
      enable_encryption: false,
      key_prefix: String::new(),
    }
  }
}

impl CacheConfig {
  /// Check the capacity limits. Called by every cache constructor.
  pub fn validate(&self) -> Result<()> {
    if self.max_size == 0 {
      return Err(CacheError::config("max_size must be greater than zero"));
    }
    if self.max_memory_size == 0 {
      return Err(CacheError::config("max_memory_size must be greater than zero"));
    }
    if self.max_disk_size == 0 {
      return Err(CacheError::config("max_disk_size must be greater than zero"));
    }
    Ok(())
  }

  /// TTL for a `set` call: the explicit one, else the configured default.
  pub fn effective_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
    match ttl {
      Some(ttl) => Some(ttl),
      None if self.default_ttl.is_zero() => None,
      None => Some(self.default_ttl),
    }
  }
}
