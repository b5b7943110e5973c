//! Owner of the current `OfflineStatus`.

use chrono::Utc;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use super::policy::SyncPolicy;
use super::status::{
  next_status, NetworkQuality, OfflineConfig, OfflineReason, OfflineStatus, ProbeReport,
};
use crate::event::Listeners;

/// Emitted when the mode, availability or reason changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
  pub previous: OfflineStatus,
  pub current: OfflineStatus,
}

/// Folds probe reports into the current status and publishes changes.
///
/// Readers get snapshots (`current`) or a `watch` receiver; the status value
/// itself is never mutated in place.
pub struct StatusTracker {
  config: OfflineConfig,
  status: watch::Sender<OfflineStatus>,
  quality: Mutex<NetworkQuality>,
  listeners: Listeners<StatusChange>,
}

impl StatusTracker {
  pub fn new(config: OfflineConfig) -> Self {
    let (status, _) = watch::channel(OfflineStatus::initial(config.max_retry_count));
    Self {
      config,
      status,
      quality: Mutex::new(NetworkQuality::Good),
      listeners: Listeners::new(),
    }
  }

  pub fn current(&self) -> OfflineStatus {
    self.status.borrow().clone()
  }

  pub fn quality(&self) -> NetworkQuality {
    *self
      .quality
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn subscribe(&self) -> watch::Receiver<OfflineStatus> {
    self.status.subscribe()
  }

  pub fn listeners(&self) -> &Listeners<StatusChange> {
    &self.listeners
  }

  /// Sync policy for the current status and last reported link quality.
  pub fn policy(&self) -> SyncPolicy {
    SyncPolicy::derive(&self.current(), self.quality())
  }

  /// Fold in a probe result. Returns the new status.
  pub fn apply(&self, report: ProbeReport) -> OfflineStatus {
    *self
      .quality
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner()) = report.quality;
    self.transition(|current| next_status(current, &report, Utc::now(), &self.config))
  }

  pub fn force_offline(&self, reason: OfflineReason) -> OfflineStatus {
    self.transition(|current| current.force_offline(reason, Utc::now()))
  }

  pub fn clear_override(&self) -> OfflineStatus {
    self.transition(|current| current.clear_override())
  }

  fn transition<F>(&self, next: F) -> OfflineStatus
  where
    F: FnOnce(&OfflineStatus) -> OfflineStatus,
  {
    let mut change = None;
    self.status.send_modify(|status| {
      let updated = next(status);
      let previous = std::mem::replace(status, updated.clone());
      if previous.operation_mode != updated.operation_mode
        || previous.service_availability != updated.service_availability
        || previous.reason != updated.reason
      {
        change = Some(StatusChange {
          previous,
          current: updated,
        });
      }
    });

    let current = self.current();
    if let Some(change) = change {
      if change.previous.operation_mode != change.current.operation_mode {
        info!(
          from = %change.previous.operation_mode,
          to = %change.current.operation_mode,
          reason = ?change.current.reason,
          "Operation mode changed"
        );
      } else {
        debug!(availability = ?change.current.service_availability, "Service availability changed");
      }
      self.listeners.emit(&change);
    }
    current
  }
}
