//! Sync policy derived from the operation mode and network quality.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::status::{NetworkQuality, OfflineStatus, OperationMode};

/// How to settle a conflict between a local mutation and the remote copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
  ServerWins,
  LastModifiedWins,
  /// Local mutations are authoritative until reconciled
  ClientWins,
}

impl fmt::Display for ConflictStrategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ConflictStrategy::ServerWins => write!(f, "server wins"),
      ConflictStrategy::LastModifiedWins => write!(f, "last modified wins"),
      ConflictStrategy::ClientWins => write!(f, "client wins"),
    }
  }
}

/// Sync cadence and behavior for the current conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncPolicy {
  pub strategy: ConflictStrategy,
  #[serde(with = "secs")]
  pub sync_interval: Duration,
  pub batch_size: usize,
  pub auto_sync: bool,
  pub use_offline_queue: bool,
  /// How often the connectivity probe should run
  #[serde(with = "secs")]
  pub probe_interval: Duration,
  pub should_sync_now: bool,
}

const fn minutes(n: u64) -> Duration {
  Duration::from_secs(n * 60)
}

impl SyncPolicy {
  /// Evaluate mode and quality together: hybrid with a poor link does not
  /// sync even though `can_sync` holds.
  pub fn derive(status: &OfflineStatus, quality: NetworkQuality) -> Self {
    let mode = status.operation_mode;

    let strategy = match mode {
      OperationMode::Online => ConflictStrategy::ServerWins,
      OperationMode::Hybrid => ConflictStrategy::LastModifiedWins,
      OperationMode::ServiceOffline | OperationMode::FullyOffline => ConflictStrategy::ClientWins,
    };

    let (sync_interval, batch_size) = match mode {
      OperationMode::Online => match quality {
        NetworkQuality::Excellent => (minutes(5), 100),
        NetworkQuality::Good => (minutes(10), 50),
        NetworkQuality::Fair => (minutes(15), 25),
        NetworkQuality::Poor | NetworkQuality::None => (minutes(30), 10),
      },
      OperationMode::Hybrid => (minutes(30), 20),
      OperationMode::ServiceOffline => (minutes(60), 10),
      OperationMode::FullyOffline => (minutes(120), 5),
    };

    let probe_interval = match mode {
      OperationMode::Online => minutes(5),
      OperationMode::Hybrid => minutes(1),
      OperationMode::ServiceOffline => Duration::from_secs(30),
      OperationMode::FullyOffline => Duration::from_secs(15),
    };

    let poor_hybrid = mode == OperationMode::Hybrid
      && matches!(quality, NetworkQuality::Poor | NetworkQuality::None);

    Self {
      strategy,
      sync_interval,
      batch_size,
      auto_sync: mode != OperationMode::FullyOffline,
      use_offline_queue: status.should_use_offline_queue(),
      probe_interval,
      should_sync_now: status.can_sync() && !poor_hybrid,
    }
  }
}

mod secs {
  use serde::Serializer;
  use std::time::Duration;

  pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_secs())
  }
}
