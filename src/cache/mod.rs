//! Local caching for offline-first data access.
//!
//! Two interchangeable tiers implement `CacheStore`:
//! - `MemoryCache`: in-process map with TTL and LRU/LFU/FIFO eviction
//! - `DiskCache`: one file per entry plus a JSON index, self-healing on load
//!
//! `CacheLayer` combines them according to a `CacheStrategy` and serves stale
//! entries when the network is unavailable.

mod codec;
mod config;
mod disk;
mod entry;
mod error;
mod eviction;
mod layer;
mod memory;
mod stats;
mod timer;
mod traits;

pub use codec::{ByteTransform, Passthrough, ValueCodec};
pub use config::{CacheConfig, CacheStrategy};
pub use disk::DiskCache;
pub use entry::CacheEntry;
pub use error::{CacheError, Result};
pub use eviction::{EvictionCandidate, EvictionPolicy};
pub use layer::{CacheLayer, FetchError, LayerStats};
pub use memory::MemoryCache;
pub use stats::CacheStats;
pub use traits::{CacheEvent, CacheKey, CacheResult, CacheSource, CacheStore, Cacheable};
