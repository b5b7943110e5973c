//! Offline-first local data layer.
//!
//! - [`cache`]: memory and disk caches with TTL and LRU/LFU/FIFO eviction
//! - [`executor`]: prioritized, retryable, cancellable background tasks
//! - [`offline`]: operation mode state machine and derived sync policy
//! - [`sync`]: offline queue and reconciliation against a remote transport

pub mod cache;
pub mod config;
pub mod event;
pub mod executor;
pub mod logging;
pub mod offline;
pub mod sync;
