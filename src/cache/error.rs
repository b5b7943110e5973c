//! Error taxonomy shared by every cache tier.

use thiserror::Error;

/// Result alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors returned by cache operations.
///
/// Cache tiers never panic or swallow failures; every public operation
/// returns one of these so callers can decide whether to retry, log or give up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
  #[error("Key not found: {0}")]
  KeyNotFound(String),

  #[error("Serialization error: {0}")]
  Serialization(String),

  #[error("Deserialization error: {0}")]
  Deserialization(String),

  #[error("Compression error: {0}")]
  Compression(String),

  #[error("Encryption error: {0}")]
  Encryption(String),

  #[error("Storage error: {0}")]
  Storage(String),

  #[error("Configuration error: {0}")]
  Configuration(String),

  #[error("Operation timed out: {0}")]
  OperationTimeout(String),

  #[error("Capacity exceeded: {0}")]
  CapacityExceeded(String),

  #[error("Cache is closed")]
  Closed,
}

impl CacheError {
  pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
    Self::Serialization(e.to_string())
  }

  pub fn deserialization<E: std::fmt::Display>(e: E) -> Self {
    Self::Deserialization(e.to_string())
  }

  pub fn storage<E: std::fmt::Display>(e: E) -> Self {
    Self::Storage(e.to_string())
  }

  pub fn config<E: std::fmt::Display>(e: E) -> Self {
    Self::Configuration(e.to_string())
  }

  /// Error for a mutex that was poisoned by a panicking holder.
  pub(crate) fn poisoned<E: std::fmt::Display>(e: E) -> Self {
    Self::Storage(format!("Lock poisoned: {}", e))
  }
}

impl From<std::io::Error> for CacheError {
  fn from(e: std::io::Error) -> Self {
    Self::Storage(e.to_string())
  }
}
