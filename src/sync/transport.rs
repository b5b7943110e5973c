//! Remote data transport consumed by the sync coordinator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::executor::TaskError;

/// Failure talking to the remote service.
///
/// Errors are retryable unless the transport says otherwise.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
  pub message: String,
  pub retryable: bool,
}

impl TransportError {
  pub fn retryable<E: std::fmt::Display>(e: E) -> Self {
    Self {
      message: e.to_string(),
      retryable: true,
    }
  }

  /// The remote rejected the request; repeating it won't help.
  pub fn permanent<E: std::fmt::Display>(e: E) -> Self {
    Self {
      message: e.to_string(),
      retryable: false,
    }
  }
}

impl From<TransportError> for TaskError {
  fn from(e: TransportError) -> Self {
    if e.retryable {
      TaskError::Failed(e.message)
    } else {
      TaskError::Fatal(e.message)
    }
  }
}

/// A remote entity and when it was last modified on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
  pub id: String,
  pub payload: Value,
  pub modified_at: DateTime<Utc>,
}

/// Opaque client for the remote service.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
  async fn get(&self, collection: &str, id: &str) -> Result<Option<RemoteRecord>, TransportError>;

  async fn list(&self, collection: &str) -> Result<Vec<RemoteRecord>, TransportError>;

  async fn create(
    &self,
    collection: &str,
    id: &str,
    payload: &Value,
  ) -> Result<RemoteRecord, TransportError>;

  async fn update(
    &self,
    collection: &str,
    id: &str,
    payload: &Value,
  ) -> Result<RemoteRecord, TransportError>;

  async fn delete(&self, collection: &str, id: &str) -> Result<(), TransportError>;
}
