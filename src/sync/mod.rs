//! Offline-aware synchronisation with a remote service.
//!
//! Writes go direct while the policy allows it and to a persistent queue
//! otherwise; queued writes are replayed by background reconciliation with
//! per-mode conflict resolution.

mod conflict;
mod coordinator;
mod queue;
mod tasks;
#[cfg(test)]
mod testing;
mod transport;

pub use conflict::{resolve_conflict, Resolution};
pub use coordinator::{SubmitOutcome, SyncCoordinator, SyncError};
pub use queue::{MutationKind, MutationQueue, PendingMutation};
pub use tasks::{ApplyOutcome, CacheCleanupTask};
pub use transport::{RemoteRecord, RemoteTransport, TransportError};
