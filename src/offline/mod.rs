//! Operation mode tracking and the sync policy derived from it.

mod policy;
mod status;
mod tracker;

pub use policy::{ConflictStrategy, SyncPolicy};
pub use status::{
  next_status, NetworkQuality, OfflineConfig, OfflineReason, OfflineStatus, OperationMode,
  ProbeReport, ServiceAvailability, StatusUpdate,
};
pub use tracker::{StatusChange, StatusTracker};
