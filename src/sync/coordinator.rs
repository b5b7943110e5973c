//! Routes writes to the remote service or the offline queue and schedules
//! reconciliation, both according to the current `SyncPolicy`.

use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::queue::{MutationQueue, PendingMutation};
use super::tasks::{ApplyMutationTask, ReconcileTask};
use super::transport::RemoteTransport;
use crate::cache::CacheError;
use crate::executor::{BackgroundTaskExecutor, TaskError, TaskId, TaskPriority};
use crate::offline::StatusTracker;

#[derive(Error, Debug)]
pub enum SyncError {
  #[error("Offline queue error: {0}")]
  Queue(#[from] CacheError),

  #[error("Executor error: {0}")]
  Task(#[from] TaskError),
}

/// Where `submit_mutation` sent a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
  /// Running on the executor against the remote service
  Dispatched(TaskId),
  /// Stored in the offline queue under this key
  Queued(String),
}

/// Ties the remote transport, the executor, the status tracker and the
/// offline queue together.
pub struct SyncCoordinator {
  transport: Arc<dyn RemoteTransport>,
  executor: Arc<BackgroundTaskExecutor>,
  tracker: Arc<StatusTracker>,
  queue: Arc<MutationQueue>,
  reconcile_task: Mutex<Option<TaskId>>,
}

impl SyncCoordinator {
  pub fn new(
    transport: Arc<dyn RemoteTransport>,
    executor: Arc<BackgroundTaskExecutor>,
    tracker: Arc<StatusTracker>,
    queue: Arc<MutationQueue>,
  ) -> Self {
    Self {
      transport,
      executor,
      tracker,
      queue,
      reconcile_task: Mutex::new(None),
    }
  }

  pub fn queue(&self) -> &Arc<MutationQueue> {
    &self.queue
  }

  pub fn tracker(&self) -> &Arc<StatusTracker> {
    &self.tracker
  }

  pub fn executor(&self) -> &Arc<BackgroundTaskExecutor> {
    &self.executor
  }

  /// Send a local write towards the remote service.
  ///
  /// When the current policy says to use the offline queue the mutation is
  /// persisted and returned as `Queued`. Otherwise it runs as a high-priority
  /// task; if that task ends without applying the write (retries exhausted,
  /// cancelled, executor shut down) the mutation lands in the queue instead
  /// of being dropped.
  pub fn submit_mutation(
    &self,
    mutation: PendingMutation,
  ) -> Result<SubmitOutcome, SyncError> {
    let policy = self.tracker.policy();
    if policy.use_offline_queue {
      let key = self.queue.push(mutation)?;
      debug!(key = %key, "Offline, mutation queued");
      return Ok(SubmitOutcome::Queued(key));
    }

    let task = ApplyMutationTask {
      transport: Arc::clone(&self.transport),
      queue: Arc::clone(&self.queue),
      mutation,
      strategy: policy.strategy,
    };
    let id = self
      .executor
      .submit_task(Arc::new(task), TaskPriority::High, None)?;
    Ok(SubmitOutcome::Dispatched(id))
  }

  /// Schedule a pass over the offline queue.
  ///
  /// Returns `None` when the policy says not to sync now or nothing is
  /// queued. A reconciliation that is still queued or running is reused.
  pub fn reconcile(&self) -> Result<Option<TaskId>, SyncError> {
    let policy = self.tracker.policy();
    if !policy.should_sync_now {
      debug!(mode = %self.tracker.current().operation_mode, "Sync suppressed by policy");
      return Ok(None);
    }
    if self.queue.is_empty()? {
      return Ok(None);
    }

    let mut current = self
      .reconcile_task
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(id) = *current {
      if self
        .executor
        .task_status(id)
        .is_some_and(|status| !status.is_terminal())
      {
        return Ok(Some(id));
      }
    }

    let task = ReconcileTask {
      transport: Arc::clone(&self.transport),
      queue: Arc::clone(&self.queue),
      strategy: policy.strategy,
      batch_size: policy.batch_size,
    };
    let id = self
      .executor
      .submit_task(Arc::new(task), TaskPriority::Normal, None)?;
    info!(
      task = %id,
      batch_size = policy.batch_size,
      strategy = %policy.strategy,
      "Scheduled reconciliation"
    );
    *current = Some(id);
    Ok(Some(id))
  }

  /// Reconcile every `sync_interval`, and right away whenever the status
  /// changes. Stops when the tracker is dropped or the handle is aborted.
  pub fn spawn_auto_sync(self: &Arc<Self>) -> JoinHandle<()> {
    let coordinator = Arc::clone(self);
    let mut status = self.tracker.subscribe();
    tokio::spawn(async move {
      loop {
        let policy = coordinator.tracker.policy();
        if policy.auto_sync {
          if let Err(e) = coordinator.reconcile() {
            warn!(error = %e, "Automatic reconciliation failed to start");
          }
        }
        tokio::select! {
          _ = tokio::time::sleep(policy.sync_interval) => {}
          changed = status.changed() => {
            if changed.is_err() {
              break;
            }
          }
        }
      }
    })
  }
}
