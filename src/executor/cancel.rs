//! Cooperative cancellation handle shared between the executor and a task.

use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use super::task::TaskError;

/// Cancellation token plus the reason it was cancelled with.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
  token: CancellationToken,
  reason: Arc<Mutex<Option<String>>>,
}

impl CancelHandle {
  pub fn new() -> Self {
    Self::default()
  }

  /// Request cancellation. The first reason wins.
  pub fn cancel(&self, reason: impl Into<String>) {
    if let Ok(mut slot) = self.reason.lock() {
      if slot.is_none() {
        *slot = Some(reason.into());
      }
    }
    self.token.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn reason(&self) -> Option<String> {
    self.reason.lock().ok().and_then(|slot| slot.clone())
  }

  pub fn check(&self) -> Result<(), TaskError> {
    if self.is_cancelled() {
      Err(self.cancelled_error())
    } else {
      Ok(())
    }
  }

  pub(crate) fn cancelled_error(&self) -> TaskError {
    TaskError::Cancelled(self.reason().unwrap_or_else(|| "cancelled".to_string()))
  }

  pub async fn cancelled(&self) {
    self.token.cancelled().await
  }
}
