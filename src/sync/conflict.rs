//! Conflict resolution between a queued mutation and the remote copy.

use serde::Serialize;

use super::queue::PendingMutation;
use super::transport::RemoteRecord;
use crate::offline::ConflictStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
  /// Push the local mutation to the remote service
  ApplyLocal,
  /// Drop the local mutation in favour of the remote copy
  KeepRemote,
}

/// Decide what happens to `mutation` given the current remote copy.
///
/// There is no conflict when the remote copy is absent or hasn't changed
/// since the version the local edit was based on.
pub fn resolve_conflict(
  strategy: ConflictStrategy,
  mutation: &PendingMutation,
  remote: Option<&RemoteRecord>,
) -> Resolution {
  let Some(remote) = remote else {
    return Resolution::ApplyLocal;
  };
  if mutation
    .base_modified_at
    .is_some_and(|base| remote.modified_at <= base)
  {
    return Resolution::ApplyLocal;
  }

  match strategy {
    ConflictStrategy::ServerWins => Resolution::KeepRemote,
    ConflictStrategy::ClientWins => Resolution::ApplyLocal,
    ConflictStrategy::LastModifiedWins => {
      if mutation.modified_at >= remote.modified_at {
        Resolution::ApplyLocal
      } else {
        Resolution::KeepRemote
      }
    }
  }
}
