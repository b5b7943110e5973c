//! Value encoding pipeline for the disk tier.
//!
//! Writes run serialize -> compress -> encrypt; reads run the exact reverse.
//! No compression or encryption algorithm ships with the crate: enabling
//! either flag installs a pass-through stage so the pipeline shape (and the
//! stage order) is fixed even before a real implementation is plugged in.

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::config::CacheConfig;
use super::error::{CacheError, Result};

/// One reversible byte transformation.
pub trait ByteTransform: Send + Sync {
  fn encode(&self, bytes: Vec<u8>) -> std::result::Result<Vec<u8>, String>;
  fn decode(&self, bytes: Vec<u8>) -> std::result::Result<Vec<u8>, String>;
}

/// Identity transform.
pub struct Passthrough;

impl ByteTransform for Passthrough {
  fn encode(&self, bytes: Vec<u8>) -> std::result::Result<Vec<u8>, String> {
    Ok(bytes)
  }

  fn decode(&self, bytes: Vec<u8>) -> std::result::Result<Vec<u8>, String> {
    Ok(bytes)
  }
}

/// Serializer plus optional compression and encryption stages.
pub struct ValueCodec {
  compression: Option<Box<dyn ByteTransform>>,
  encryption: Option<Box<dyn ByteTransform>>,
}

impl ValueCodec {
  /// Codec with the stages the configuration asks for.
  pub fn from_config(config: &CacheConfig) -> Self {
    let compression: Option<Box<dyn ByteTransform>> = if config.enable_compression {
      debug!("Compression requested; using pass-through stage");
      Some(Box::new(Passthrough))
    } else {
      None
    };
    let encryption: Option<Box<dyn ByteTransform>> = if config.enable_encryption {
      debug!("Encryption requested; using pass-through stage");
      Some(Box::new(Passthrough))
    } else {
      None
    };
    Self {
      compression,
      encryption,
    }
  }

  /// Codec with caller-supplied stages.
  pub fn with_stages(
    compression: Option<Box<dyn ByteTransform>>,
    encryption: Option<Box<dyn ByteTransform>>,
  ) -> Self {
    Self {
      compression,
      encryption,
    }
  }

  pub fn encode<V: Serialize>(&self, value: &V) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value).map_err(CacheError::serialization)?;
    if let Some(stage) = &self.compression {
      bytes = stage.encode(bytes).map_err(CacheError::Compression)?;
    }
    if let Some(stage) = &self.encryption {
      bytes = stage.encode(bytes).map_err(CacheError::Encryption)?;
    }
    Ok(bytes)
  }

  pub fn decode<V: DeserializeOwned>(&self, mut bytes: Vec<u8>) -> Result<V> {
    if let Some(stage) = &self.encryption {
      bytes = stage.decode(bytes).map_err(CacheError::Encryption)?;
    }
    if let Some(stage) = &self.compression {
      bytes = stage.decode(bytes).map_err(CacheError::Compression)?;
    }
    serde_json::from_slice(&bytes).map_err(CacheError::deserialization)
  }
}
