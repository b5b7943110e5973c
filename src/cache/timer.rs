//! Periodic expiry sweep owned by a cache instance.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Background task that runs a sweep every `interval` until stopped.
///
/// The task only holds a weak reference to its target, so dropping the cache
/// also ends the loop. `stop` (called from `close`) and `Drop` abort it.
pub(crate) struct CleanupTimer {
  handle: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupTimer {
  /// A timer that never fires.
  pub fn disabled() -> Self {
    Self {
      handle: Mutex::new(None),
    }
  }

  /// Start sweeping `target` every `interval`.
  ///
  /// Needs a tokio runtime; without one (or with a zero interval) the timer
  /// is disabled and callers rely on explicit `cleanup()` and lazy expiry.
  pub fn start<T, F>(interval: Duration, target: Weak<T>, sweep: F) -> Self
  where
    T: Send + Sync + 'static,
    F: Fn(&T) + Send + Sync + 'static,
  {
    if interval.is_zero() {
      return Self::disabled();
    }
    let runtime = match tokio::runtime::Handle::try_current() {
      Ok(runtime) => runtime,
      Err(_) => {
        debug!("No tokio runtime available, periodic cleanup disabled");
        return Self::disabled();
      }
    };

    let sweep = Arc::new(sweep);
    let handle = runtime.spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      // The first tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(target) = target.upgrade() else {
          break;
        };
        let sweep = Arc::clone(&sweep);
        // Sweeps may touch the filesystem
        if tokio::task::spawn_blocking(move || sweep(&target))
          .await
          .is_err()
        {
          break;
        }
      }
    });

    Self {
      handle: Mutex::new(Some(handle)),
    }
  }

  pub fn is_running(&self) -> bool {
    self
      .handle
      .lock()
      .map(|handle| handle.as_ref().is_some_and(|h| !h.is_finished()))
      .unwrap_or(false)
  }

  /// Abort the background task. Idempotent.
  pub fn stop(&self) {
    let mut handle = self
      .handle
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(handle) = handle.take() {
      handle.abort();
    }
  }
}

impl Drop for CleanupTimer {
  fn drop(&mut self) {
    self.stop();
  }
}
