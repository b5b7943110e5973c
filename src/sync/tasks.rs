//! Executor tasks that move data between the local store and the remote.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::conflict::{resolve_conflict, Resolution};
use super::queue::{MutationKind, MutationQueue, PendingMutation};
use super::transport::{RemoteTransport, TransportError};
use crate::cache::{CacheKey, CacheLayer, Cacheable};
use crate::executor::{BackgroundTask, TaskContext, TaskError, TaskOutput};
use crate::offline::ConflictStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
  Applied,
  KeptRemote,
}

/// Replay one mutation against the remote, resolving conflicts first.
pub(crate) async fn apply_mutation(
  transport: &dyn RemoteTransport,
  mutation: &PendingMutation,
  strategy: ConflictStrategy,
) -> Result<ApplyOutcome, TransportError> {
  let collection = mutation.collection.as_str();
  let id = mutation.entity_id.as_str();
  let remote = transport.get(collection, id).await?;

  if resolve_conflict(strategy, mutation, remote.as_ref()) == Resolution::KeepRemote {
    debug!(collection, id, %strategy, "Conflict resolved in favour of remote copy");
    return Ok(ApplyOutcome::KeptRemote);
  }

  match (mutation.kind, remote.is_some()) {
    (MutationKind::Delete, true) => transport.delete(collection, id).await?,
    // Already gone
    (MutationKind::Delete, false) => {}
    (MutationKind::Create | MutationKind::Update, true) => {
      transport.update(collection, id, &mutation.payload).await?;
    }
    (MutationKind::Create | MutationKind::Update, false) => {
      transport.create(collection, id, &mutation.payload).await?;
    }
  }
  Ok(ApplyOutcome::Applied)
}

/// Sends one mutation straight to the remote.
///
/// If every retry fails with a retryable error the mutation is moved to the
/// offline queue. A task that ends any other way without applying the write
/// (cancelled, shut down, refused) also leaves it in the queue; a permanent
/// refusal is stored already parked as rejected.
pub(crate) struct ApplyMutationTask {
  pub(crate) transport: Arc<dyn RemoteTransport>,
  pub(crate) queue: Arc<MutationQueue>,
  pub(crate) mutation: PendingMutation,
  pub(crate) strategy: ConflictStrategy,
}

#[async_trait]
impl BackgroundTask for ApplyMutationTask {
  fn name(&self) -> &str {
    "apply-mutation"
  }

  async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
    ctx.check_cancelled()?;
    match apply_mutation(self.transport.as_ref(), &self.mutation, self.strategy).await {
      Ok(outcome) => Ok(json!(outcome)),
      Err(e) if e.retryable && ctx.is_final_attempt() => {
        let key = self.queue.push(self.mutation.clone()).map_err(TaskError::fatal)?;
        warn!(
          collection = %self.mutation.collection,
          entity = %self.mutation.entity_id,
          key = %key,
          error = %e,
          "Remote unreachable, mutation moved to offline queue"
        );
        Ok(json!({ "queued": key }))
      }
      Err(e) => Err(e.into()),
    }
  }

  fn on_abandoned(&self, error: &TaskError) {
    let mut mutation = self.mutation.clone();
    if let TaskError::Fatal(reason) = error {
      mutation.rejected = Some(reason.clone());
    }
    let collection = mutation.collection.clone();
    let entity = mutation.entity_id.clone();
    match self.queue.push(mutation) {
      Ok(key) => warn!(
        collection = %collection,
        entity = %entity,
        key = %key,
        error = %error,
        "Mutation not applied, kept in offline queue"
      ),
      Err(e) => error!(
        collection = %collection,
        entity = %entity,
        error = %e,
        "Failed to keep unapplied mutation in offline queue"
      ),
    }
  }
}

/// Drains the offline queue in batches.
///
/// Cancellation is checked between mutations; whatever was applied stays
/// acknowledged. A retryable transport error fails the attempt so the
/// executor retries it with backoff.
pub(crate) struct ReconcileTask {
  pub(crate) transport: Arc<dyn RemoteTransport>,
  pub(crate) queue: Arc<MutationQueue>,
  pub(crate) strategy: ConflictStrategy,
  pub(crate) batch_size: usize,
}

#[derive(Debug, Default, Serialize)]
struct ReconcileReport {
  applied: usize,
  kept_remote: usize,
  rejected: usize,
}

#[async_trait]
impl BackgroundTask for ReconcileTask {
  fn name(&self) -> &str {
    "reconcile"
  }

  async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
    let mut report = ReconcileReport::default();
    loop {
      let batch = self
        .queue
        .peek_batch(self.batch_size.max(1))
        .map_err(TaskError::failed)?;
      if batch.is_empty() {
        break;
      }
      debug!(size = batch.len(), "Reconciling batch");

      for (key, mutation) in batch {
        ctx.check_cancelled()?;
        match apply_mutation(self.transport.as_ref(), &mutation, self.strategy).await {
          Ok(ApplyOutcome::Applied) => {
            report.applied += 1;
            self.queue.ack(&key).map_err(TaskError::failed)?;
          }
          Ok(ApplyOutcome::KeptRemote) => {
            report.kept_remote += 1;
            self.queue.ack(&key).map_err(TaskError::failed)?;
          }
          Err(e) if e.retryable => return Err(e.into()),
          Err(e) => {
            warn!(
              key = %key,
              entity = %mutation.entity_id,
              error = %e,
              "Remote refused queued mutation"
            );
            report.rejected += 1;
            self.queue.reject(&key, &e.message).map_err(TaskError::failed)?;
          }
        }
      }
    }

    info!(
      applied = report.applied,
      kept_remote = report.kept_remote,
      rejected = report.rejected,
      "Reconciliation finished"
    );
    serde_json::to_value(&report).map_err(TaskError::fatal)
  }
}

/// Expiry sweep over a cache layer, run as background maintenance.
pub struct CacheCleanupTask<K, V> {
  layer: Arc<CacheLayer<K, V>>,
}

impl<K, V> CacheCleanupTask<K, V> {
  pub fn new(layer: Arc<CacheLayer<K, V>>) -> Self {
    Self { layer }
  }
}

#[async_trait]
impl<K: CacheKey, V: Cacheable> BackgroundTask for CacheCleanupTask<K, V> {
  fn name(&self) -> &str {
    "cache-cleanup"
  }

  fn max_retries(&self) -> Option<u32> {
    Some(0)
  }

  async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
    ctx.check_cancelled()?;
    let layer = Arc::clone(&self.layer);
    let removed = tokio::task::spawn_blocking(move || layer.cleanup())
      .await
      .map_err(TaskError::fatal)?
      .map_err(TaskError::fatal)?;
    Ok(json!({ "removed": removed }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheConfig, CacheStrategy};
  use crate::executor::{BackgroundTaskExecutor, ExecutorConfig, RetryPolicy, TaskStatus};
  use crate::sync::testing::MemoryTransport;
  use crate::sync::transport::RemoteRecord;
  use chrono::{Duration as ChronoDuration, Utc};
  use std::time::Duration;

  fn executor(default_max_retries: u32) -> BackgroundTaskExecutor {
    BackgroundTaskExecutor::new(ExecutorConfig {
      max_concurrent_tasks: 2,
      retry: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2)),
      default_max_retries,
      ..ExecutorConfig::default()
    })
  }

  fn note(id: &str, kind: MutationKind) -> PendingMutation {
    PendingMutation::new("notes", id, kind, json!({ "title": id }))
  }

  #[tokio::test]
  async fn test_apply_creates_updates_and_deletes() {
    let transport = MemoryTransport::default();
    let strategy = ConflictStrategy::ClientWins;

    let outcome = apply_mutation(&transport, &note("a", MutationKind::Update), strategy).await;
    assert_eq!(outcome, Ok(ApplyOutcome::Applied));
    assert!(transport.calls().contains(&"create notes/a".to_string()));

    apply_mutation(&transport, &note("a", MutationKind::Update), strategy)
      .await
      .unwrap();
    assert!(transport.calls().contains(&"update notes/a".to_string()));

    apply_mutation(&transport, &note("a", MutationKind::Delete), strategy)
      .await
      .unwrap();
    assert!(transport.record("notes", "a").is_none());
  }

  #[tokio::test]
  async fn test_server_wins_skips_write() {
    let transport = MemoryTransport::default();
    transport.insert(
      "notes",
      RemoteRecord {
        id: "a".into(),
        payload: json!({ "title": "remote" }),
        modified_at: Utc::now(),
      },
    );
    let mutation =
      note("a", MutationKind::Update).based_on(Utc::now() - ChronoDuration::seconds(30));
    let outcome = apply_mutation(&transport, &mutation, ConflictStrategy::ServerWins).await;
    assert_eq!(outcome, Ok(ApplyOutcome::KeptRemote));
    assert_eq!(transport.record("notes", "a").unwrap().payload, json!({ "title": "remote" }));
  }

  #[tokio::test]
  async fn test_exhausted_apply_moves_mutation_to_queue() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = Arc::new(MutationQueue::open(tmp.path(), 10).unwrap());
    let transport = Arc::new(MemoryTransport::default());
    for _ in 0..2 {
      transport.fail_next(TransportError::retryable("connection reset"));
    }

    let executor = executor(1);
    let id = executor
      .submit(ApplyMutationTask {
        transport: transport.clone(),
        queue: Arc::clone(&queue),
        mutation: note("a", MutationKind::Create),
        strategy: ConflictStrategy::ServerWins,
      })
      .unwrap();
    let output = executor.wait_for_task(id).await.unwrap();
    assert!(output.get("queued").is_some());
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_permanent_apply_error_is_surfaced_and_parked() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = Arc::new(MutationQueue::open(tmp.path(), 10).unwrap());
    let transport = Arc::new(MemoryTransport::default());
    transport.fail_next(TransportError::permanent("403 forbidden"));

    let executor = executor(3);
    let id = executor
      .submit(ApplyMutationTask {
        transport,
        queue: Arc::clone(&queue),
        mutation: note("a", MutationKind::Create),
        strategy: ConflictStrategy::ServerWins,
      })
      .unwrap();
    assert_eq!(
      executor.wait_for_task(id).await,
      Err(TaskError::Fatal("403 forbidden".into()))
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(queue.is_empty().unwrap());
    let rejected = queue.rejected().unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].1.rejected.as_deref(), Some("403 forbidden"));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_apply_interrupted_by_shutdown_is_queued() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = Arc::new(MutationQueue::open(tmp.path(), 10).unwrap());
    let transport = Arc::new(MemoryTransport::default());
    transport.fail_next(TransportError::retryable("connection reset"));

    let executor = BackgroundTaskExecutor::new(ExecutorConfig {
      max_concurrent_tasks: 1,
      retry: RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(60)),
      default_max_retries: 3,
      ..ExecutorConfig::default()
    });
    let id = executor
      .submit(ApplyMutationTask {
        transport: transport.clone(),
        queue: Arc::clone(&queue),
        mutation: note("a", MutationKind::Create),
        strategy: ConflictStrategy::ClientWins,
      })
      .unwrap();
    // First attempt fails and waits out a long backoff
    while executor.attempts(id) != Some(1)
      || executor.task_status(id) != Some(TaskStatus::Queued)
    {
      tokio::time::sleep(Duration::from_millis(1)).await;
    }
    executor.shutdown().await;

    assert_eq!(executor.task_status(id), Some(TaskStatus::Cancelled));
    assert!(transport.record("notes", "a").is_none());
    assert_eq!(queue.peek_batch(10).unwrap()[0].1.entity_id, "a");
  }

  #[tokio::test]
  async fn test_reconcile_drains_queue_in_batches() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = Arc::new(MutationQueue::open(tmp.path(), 10).unwrap());
    for id in ["a", "b", "c", "d", "e"] {
      queue.push(note(id, MutationKind::Create)).unwrap();
    }
    let transport = Arc::new(MemoryTransport::default());

    let executor = executor(0);
    let id = executor
      .submit(ReconcileTask {
        transport: transport.clone(),
        queue: Arc::clone(&queue),
        strategy: ConflictStrategy::ClientWins,
        batch_size: 2,
      })
      .unwrap();
    let output = executor.wait_for_task(id).await.unwrap();
    assert_eq!(output["applied"], 5);
    assert!(queue.is_empty().unwrap());
    assert!(transport.record("notes", "e").is_some());
  }

  #[tokio::test]
  async fn test_reconcile_keeps_progress_across_retries() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = Arc::new(MutationQueue::open(tmp.path(), 10).unwrap());
    queue.push(note("a", MutationKind::Create)).unwrap();
    queue.push(note("b", MutationKind::Create)).unwrap();
    let transport = Arc::new(MemoryTransport::default());
    // get a and create a succeed, then the get for b fails once
    transport.pass_next();
    transport.pass_next();
    transport.fail_next(TransportError::retryable("connection reset"));
    let transport_clone = transport.clone();

    let executor = executor(2);
    let id = executor
      .submit(ReconcileTask {
        transport: transport_clone,
        queue: Arc::clone(&queue),
        strategy: ConflictStrategy::ClientWins,
        batch_size: 10,
      })
      .unwrap();
    executor.wait_for_task(id).await.unwrap();
    assert!(queue.is_empty().unwrap());
    assert_eq!(executor.attempts(id), Some(2));
    let creates_of_a = transport
      .calls()
      .iter()
      .filter(|call| *call == "create notes/a")
      .count();
    assert_eq!(creates_of_a, 1);
  }

  #[tokio::test]
  async fn test_reconcile_parks_refused_mutations() {
    let tmp = tempfile::tempdir().unwrap();
    let queue = Arc::new(MutationQueue::open(tmp.path(), 10).unwrap());
    queue.push(note("a", MutationKind::Create)).unwrap();
    queue.push(note("b", MutationKind::Create)).unwrap();
    let transport = Arc::new(MemoryTransport::default());
    transport.fail_next(TransportError::permanent("422 invalid"));

    let executor = executor(0);
    let id = executor
      .submit(ReconcileTask {
        transport,
        queue: Arc::clone(&queue),
        strategy: ConflictStrategy::ClientWins,
        batch_size: 10,
      })
      .unwrap();
    let output = executor.wait_for_task(id).await.unwrap();
    assert_eq!(output["applied"], 1);
    assert_eq!(output["rejected"], 1);
    assert!(queue.is_empty().unwrap());
    assert_eq!(queue.rejected().unwrap()[0].1.entity_id, "a");
  }

  #[tokio::test]
  async fn test_cache_cleanup_task() {
    let layer: Arc<CacheLayer<String, i64>> = Arc::new(
      CacheLayer::open(
        CacheConfig {
          strategy: CacheStrategy::MemoryOnly,
          cleanup_interval: Duration::ZERO,
          ..CacheConfig::default()
        },
        None,
      )
      .unwrap(),
    );
    layer.set("a".into(), 1, Some(Duration::from_millis(5))).unwrap();
    layer.set("b".into(), 2, None).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let executor = executor(0);
    let id = executor.submit(CacheCleanupTask::new(Arc::clone(&layer))).unwrap();
    let output = executor.wait_for_task(id).await.unwrap();
    assert_eq!(output["removed"], 1);
    assert_eq!(layer.keys().unwrap(), vec!["b".to_string()]);
  }
}
