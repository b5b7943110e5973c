//! Operation mode state machine.
//!
//! `OfflineStatus` is an immutable value. Every transition builds a new
//! value, either through `next_status` (driven by probe reports) or through
//! `copy_with`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::executor::RetryPolicy;

/// How the application talks to the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
  /// Network and service healthy
  Online,
  /// Network reachable, service degraded
  Hybrid,
  /// Network reachable, service down or in maintenance
  ServiceOffline,
  /// No network
  FullyOffline,
}

impl fmt::Display for OperationMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OperationMode::Online => write!(f, "online"),
      OperationMode::Hybrid => write!(f, "hybrid"),
      OperationMode::ServiceOffline => write!(f, "service offline"),
      OperationMode::FullyOffline => write!(f, "fully offline"),
    }
  }
}

/// Latest service health judgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceAvailability {
  Available,
  Degraded,
  Unavailable,
  Maintenance,
  /// A probe is in flight
  Checking,
  Unknown,
}

impl ServiceAvailability {
  pub const ALL: [ServiceAvailability; 6] = [
    ServiceAvailability::Available,
    ServiceAvailability::Degraded,
    ServiceAvailability::Unavailable,
    ServiceAvailability::Maintenance,
    ServiceAvailability::Checking,
    ServiceAvailability::Unknown,
  ];
}

/// Why the application is not fully online.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineReason {
  NetworkUnavailable,
  ServiceUnavailable,
  ServiceDegraded,
  Maintenance,
  /// Manual override; probes don't clear it
  UserRequested,
}

/// Link quality reported by the network monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
  Excellent,
  Good,
  Fair,
  Poor,
  /// No connectivity
  None,
}

/// One result of the connectivity/service-health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
  pub reachable: bool,
  pub quality: NetworkQuality,
  pub service: ServiceAvailability,
}

impl ProbeReport {
  pub fn unreachable() -> Self {
    Self {
      reachable: false,
      quality: NetworkQuality::None,
      service: ServiceAvailability::Unknown,
    }
  }

  pub fn healthy(quality: NetworkQuality) -> Self {
    Self {
      reachable: true,
      quality,
      service: ServiceAvailability::Available,
    }
  }
}

/// Retry bookkeeping limits for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfflineConfig {
  pub max_retry_count: u32,
  pub retry: RetryPolicy,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      max_retry_count: 5,
      retry: RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(300)),
    }
  }
}

/// Current operation mode plus retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineStatus {
  pub operation_mode: OperationMode,
  pub service_availability: ServiceAvailability,
  pub reason: Option<OfflineReason>,
  /// When the current non-online stretch began
  pub offline_since: Option<DateTime<Utc>>,
  pub last_checked: Option<DateTime<Utc>>,
  pub retry_count: u32,
  pub max_retry_count: u32,
  pub next_retry_time: Option<DateTime<Utc>>,
}

/// Field overrides for `OfflineStatus::copy_with`. `None` keeps the field.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
  pub operation_mode: Option<OperationMode>,
  pub service_availability: Option<ServiceAvailability>,
  pub reason: Option<Option<OfflineReason>>,
  pub offline_since: Option<Option<DateTime<Utc>>>,
  pub last_checked: Option<Option<DateTime<Utc>>>,
  pub retry_count: Option<u32>,
  pub max_retry_count: Option<u32>,
  pub next_retry_time: Option<Option<DateTime<Utc>>>,
}

impl OfflineStatus {
  /// Initial state: online, service availability unknown until the first probe.
  pub fn initial(max_retry_count: u32) -> Self {
    Self {
      operation_mode: OperationMode::Online,
      service_availability: ServiceAvailability::Unknown,
      reason: None,
      offline_since: None,
      last_checked: None,
      retry_count: 0,
      max_retry_count,
      next_retry_time: None,
    }
  }

  pub fn copy_with(&self, update: StatusUpdate) -> Self {
    Self {
      operation_mode: update.operation_mode.unwrap_or(self.operation_mode),
      service_availability: update
        .service_availability
        .unwrap_or(self.service_availability),
      reason: update.reason.unwrap_or(self.reason),
      offline_since: update.offline_since.unwrap_or(self.offline_since),
      last_checked: update.last_checked.unwrap_or(self.last_checked),
      retry_count: update.retry_count.unwrap_or(self.retry_count),
      max_retry_count: update.max_retry_count.unwrap_or(self.max_retry_count),
      next_retry_time: update.next_retry_time.unwrap_or(self.next_retry_time),
    }
  }

  pub fn is_offline(&self) -> bool {
    self.operation_mode == OperationMode::FullyOffline
  }

  pub fn should_show_indicator(&self) -> bool {
    self.is_offline() || self.operation_mode == OperationMode::ServiceOffline
  }

  /// Whether writes may go straight to the remote service.
  pub fn can_sync(&self) -> bool {
    match self.operation_mode {
      OperationMode::Online => true,
      OperationMode::Hybrid => self.service_availability == ServiceAvailability::Degraded,
      OperationMode::ServiceOffline | OperationMode::FullyOffline => false,
    }
  }

  pub fn should_use_offline_queue(&self) -> bool {
    !self.can_sync()
  }

  /// Whether the reconnect budget still allows another attempt.
  pub fn can_retry(&self) -> bool {
    self.retry_count < self.max_retry_count
  }

  /// Time spent outside `Online` so far.
  pub fn offline_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
    self
      .offline_since
      .and_then(|since| (now - since).to_std().ok())
  }

  /// Switch to fully offline. With `OfflineReason::UserRequested` probe
  /// reports leave it in place until `clear_override`.
  pub fn force_offline(&self, reason: OfflineReason, now: DateTime<Utc>) -> Self {
    self.copy_with(StatusUpdate {
      operation_mode: Some(OperationMode::FullyOffline),
      reason: Some(Some(reason)),
      offline_since: Some(self.offline_since.or(Some(now))),
      next_retry_time: Some(None),
      ..StatusUpdate::default()
    })
  }

  pub fn is_user_override(&self) -> bool {
    self.reason == Some(OfflineReason::UserRequested)
  }

  /// Drop a manual override and return to the initial state.
  pub fn clear_override(&self) -> Self {
    if self.is_user_override() {
      OfflineStatus::initial(self.max_retry_count)
    } else {
      self.clone()
    }
  }
}

/// Mode a probe report points to, given the current mode.
fn target_mode(current: OperationMode, report: &ProbeReport) -> OperationMode {
  if !report.reachable {
    return OperationMode::FullyOffline;
  }
  match report.service {
    ServiceAvailability::Available => OperationMode::Online,
    ServiceAvailability::Degraded => OperationMode::Hybrid,
    ServiceAvailability::Unavailable | ServiceAvailability::Maintenance => {
      OperationMode::ServiceOffline
    }
    // Inconclusive; a reachable network at least rules out fully offline
    ServiceAvailability::Checking | ServiceAvailability::Unknown => match current {
      OperationMode::FullyOffline => OperationMode::ServiceOffline,
      mode => mode,
    },
  }
}

fn reason_for(mode: OperationMode, service: ServiceAvailability) -> Option<OfflineReason> {
  match mode {
    OperationMode::Online => None,
    OperationMode::Hybrid => Some(OfflineReason::ServiceDegraded),
    OperationMode::ServiceOffline if service == ServiceAvailability::Maintenance => {
      Some(OfflineReason::Maintenance)
    }
    OperationMode::ServiceOffline => Some(OfflineReason::ServiceUnavailable),
    OperationMode::FullyOffline => Some(OfflineReason::NetworkUnavailable),
  }
}

/// Pure transition function: the status that follows `current` after `report`.
pub fn next_status(
  current: &OfflineStatus,
  report: &ProbeReport,
  now: DateTime<Utc>,
  config: &OfflineConfig,
) -> OfflineStatus {
  let service = if report.reachable {
    report.service
  } else {
    ServiceAvailability::Unknown
  };

  if current.is_user_override() {
    return current.copy_with(StatusUpdate {
      service_availability: Some(service),
      last_checked: Some(Some(now)),
      ..StatusUpdate::default()
    });
  }

  let mode = target_mode(current.operation_mode, report);
  if mode == OperationMode::Online {
    return current.copy_with(StatusUpdate {
      operation_mode: Some(mode),
      service_availability: Some(service),
      reason: Some(None),
      offline_since: Some(None),
      last_checked: Some(Some(now)),
      retry_count: Some(0),
      max_retry_count: Some(config.max_retry_count),
      next_retry_time: Some(None),
    });
  }

  let offline_since = match current.operation_mode {
    OperationMode::Online => now,
    _ => current.offline_since.unwrap_or(now),
  };
  let retry_count = current.retry_count.saturating_add(1);
  let next_retry_time = if retry_count <= config.max_retry_count {
    chrono::Duration::from_std(config.retry.delay_for(retry_count))
      .ok()
      .and_then(|delay| now.checked_add_signed(delay))
  } else {
    None
  };

  current.copy_with(StatusUpdate {
    operation_mode: Some(mode),
    service_availability: Some(service),
    reason: Some(reason_for(mode, service)),
    offline_since: Some(Some(offline_since)),
    last_checked: Some(Some(now)),
    retry_count: Some(retry_count),
    max_retry_count: Some(config.max_retry_count),
    next_retry_time: Some(next_retry_time),
  })
}
