//! Cache statistics.

use serde::Serialize;

/// Point-in-time statistics for a cache instance.
///
/// The four counters only ever grow for the lifetime of the instance;
/// `entry_count`, `memory_usage` and `disk_usage` describe the moment the
/// snapshot was taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
  pub hit_count: u64,
  pub miss_count: u64,
  pub eviction_count: u64,
  pub expired_count: u64,
  pub entry_count: usize,
  pub memory_usage: u64,
  pub disk_usage: u64,
}

impl CacheStats {
  /// Fraction of lookups that were hits, 0 when nothing was looked up.
  pub fn hit_rate(&self) -> f64 {
    let total = self.hit_count + self.miss_count;
    if total == 0 {
      0.0
    } else {
      self.hit_count as f64 / total as f64
    }
  }
}

/// Monotonic counters kept inside a cache's locked state.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
  pub hits: u64,
  pub misses: u64,
  pub evictions: u64,
  pub expired: u64,
}

impl Counters {
  pub fn snapshot(&self, entry_count: usize, memory_usage: u64, disk_usage: u64) -> CacheStats {
    CacheStats {
      hit_count: self.hits,
      miss_count: self.misses,
      eviction_count: self.evictions,
      expired_count: self.expired,
      entry_count,
      memory_usage,
      disk_usage,
    }
  }
}
