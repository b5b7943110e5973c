//! Bounded-concurrency scheduler with priorities, delays and retries.

use futures::FutureExt;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::cancel::CancelHandle;
use super::retry::RetryPolicy;
use super::task::{
  BackgroundTask, TaskContext, TaskError, TaskEvent, TaskEventType, TaskId, TaskOutput,
  TaskPriority, TaskStatus,
};
use crate::event::Listeners;

type TaskResult = Result<TaskOutput, TaskError>;

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
  pub max_concurrent_tasks: usize,
  pub retry: RetryPolicy,
  /// Retry budget for tasks that don't set their own
  pub default_max_retries: u32,
  /// Finished tasks whose status and result stay queryable; older ones are
  /// forgotten
  pub max_finished_tasks: usize,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      max_concurrent_tasks: 4,
      retry: RetryPolicy::default(),
      default_max_retries: 3,
      max_finished_tasks: 1000,
    }
  }
}

struct TaskRecord {
  /// Released once the task settles
  task: Option<Arc<dyn BackgroundTask>>,
  name: String,
  priority: TaskPriority,
  max_retries: u32,
  /// Attempts started so far
  attempt: u32,
  delay: Duration,
  status: TaskStatus,
  cancel: CancelHandle,
  result: watch::Sender<Option<TaskResult>>,
}

/// A task that settled without completing, awaiting its `on_abandoned` call.
struct Abandoned {
  task: Arc<dyn BackgroundTask>,
  error: TaskError,
}

impl TaskRecord {
  fn settle(&mut self, status: TaskStatus, result: TaskResult) -> Option<Abandoned> {
    self.status = status;
    let task = self.task.take();
    let abandoned = match (&result, task) {
      (Err(error), Some(task)) => Some(Abandoned {
        task,
        error: error.clone(),
      }),
      _ => None,
    };
    self.result.send_replace(Some(result));
    abandoned
  }
}

/// Entry in the ready queue: higher priority first, then submission order.
#[derive(Debug, PartialEq, Eq)]
struct Ready {
  priority: TaskPriority,
  seq: u64,
  id: TaskId,
}

impl Ord for Ready {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .priority
      .cmp(&other.priority)
      .then_with(|| other.seq.cmp(&self.seq))
  }
}

impl PartialOrd for Ready {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

#[derive(Default)]
struct State {
  tasks: HashMap<u64, TaskRecord>,
  ready: BinaryHeap<Ready>,
  delayed: BinaryHeap<Reverse<(Instant, u64, TaskId)>>,
  /// Settled task ids, oldest first
  finished: VecDeque<u64>,
  running: usize,
  next_id: u64,
  next_seq: u64,
  shutdown: bool,
}

impl State {
  fn enqueue(&mut self, id: TaskId, priority: TaskPriority, delay: Duration) {
    let seq = self.next_seq;
    self.next_seq += 1;
    if delay.is_zero() {
      self.ready.push(Ready { priority, seq, id });
    } else {
      self.delayed.push(Reverse((Instant::now() + delay, seq, id)));
    }
  }

  /// Remember a settled task, forgetting the oldest beyond `keep`.
  fn retire(&mut self, id: TaskId, keep: usize) {
    self.finished.push_back(id.0);
    while self.finished.len() > keep {
      let Some(old) = self.finished.pop_front() else {
        break;
      };
      if self.tasks.get(&old).is_some_and(|record| record.status.is_terminal()) {
        self.tasks.remove(&old);
      }
    }
  }

  /// Move delayed tasks whose time has come into the ready queue.
  fn promote_due(&mut self, now: Instant) {
    while let Some(Reverse((at, seq, id))) = self.delayed.peek().copied() {
      if at > now {
        break;
      }
      self.delayed.pop();
      if let Some(record) = self.tasks.get(&id.0) {
        if record.status == TaskStatus::Queued {
          self.ready.push(Ready {
            priority: record.priority,
            seq,
            id,
          });
        }
      }
    }
  }
}

/// An attempt ready to be spawned.
struct Launch {
  task: Arc<dyn BackgroundTask>,
  ctx: TaskContext,
}

struct Shared {
  config: ExecutorConfig,
  state: Mutex<State>,
  wake: Notify,
  listeners: Listeners<TaskEvent>,
}

impl Shared {
  fn lock(&self) -> MutexGuard<'_, State> {
    // A poisoned scheduler state is still structurally valid
    self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn emit_all(&self, events: Vec<TaskEvent>) {
    for event in &events {
      self.listeners.emit(event);
    }
  }

  fn abandon(&self, abandoned: Vec<Abandoned>) {
    for Abandoned { task, error } in abandoned {
      let hook = std::panic::catch_unwind(AssertUnwindSafe(|| task.on_abandoned(&error)));
      if hook.is_err() {
        warn!(name = %task.name(), "Task abandon hook panicked");
      }
    }
  }

  /// Refuse new work and settle every queued task as cancelled. Running
  /// tasks only get their token set. Idempotent.
  fn stop(&self) {
    const REASON: &str = "executor shut down";
    let mut events = Vec::new();
    let mut abandoned = Vec::new();
    {
      let mut guard = self.lock();
      let state = &mut *guard;
      if state.shutdown {
        return;
      }
      state.shutdown = true;
      let mut settled = Vec::new();
      for (id, record) in state.tasks.iter_mut() {
        match record.status {
          TaskStatus::Queued => {
            record.cancel.cancel(REASON);
            abandoned.extend(
              record.settle(TaskStatus::Cancelled, Err(TaskError::Cancelled(REASON.to_string()))),
            );
            events.push(
              TaskEvent::new(TaskId(*id), TaskEventType::Cancelled, &record.name, record.attempt)
                .with_detail(REASON),
            );
            settled.push(TaskId(*id));
          }
          TaskStatus::Running => record.cancel.cancel(REASON),
          _ => {}
        }
      }
      settled.sort();
      for id in settled {
        state.retire(id, self.config.max_finished_tasks);
      }
    }
    self.emit_all(events);
    self.abandon(abandoned);
    self.wake.notify_one();
  }

  /// Pick the next attempts to run, bounded by the concurrency limit.
  /// Returns the launches and the instant of the next delayed task, if any.
  fn dispatch(&self) -> Option<(Vec<Launch>, Vec<TaskEvent>, Option<Instant>)> {
    let mut guard = self.lock();
    let state = &mut *guard;
    if state.shutdown {
      return None;
    }
    state.promote_due(Instant::now());

    let mut launches = Vec::new();
    let mut events = Vec::new();
    while state.running < self.config.max_concurrent_tasks.max(1) {
      let Some(item) = state.ready.pop() else {
        break;
      };
      let Some(record) = state.tasks.get_mut(&item.id.0) else {
        continue;
      };
      // Cancelled while waiting
      if record.status != TaskStatus::Queued {
        continue;
      }
      let Some(task) = record.task.clone() else {
        continue;
      };
      record.status = TaskStatus::Running;
      record.attempt += 1;
      state.running += 1;

      debug!(task = %item.id, name = %record.name, attempt = record.attempt, "Starting task");
      events.push(TaskEvent::new(
        item.id,
        TaskEventType::Started,
        &record.name,
        record.attempt,
      ));
      launches.push(Launch {
        task,
        ctx: TaskContext::new(
          item.id,
          record.attempt,
          record.max_retries,
          record.delay,
          record.cancel.clone(),
        ),
      });
    }

    let next_delayed = state.delayed.peek().map(|Reverse((at, _, _))| *at);
    Some((launches, events, next_delayed))
  }

  /// Record the outcome of one attempt.
  fn finish(&self, id: TaskId, attempt: u32, outcome: TaskResult) {
    let mut events = Vec::new();
    let mut abandoned = None;
    {
      let mut guard = self.lock();
      let state = &mut *guard;
      state.running = state.running.saturating_sub(1);
      let shutdown = state.shutdown;
      let Some(record) = state.tasks.get_mut(&id.0) else {
        return;
      };

      let settled = match outcome {
        Ok(value) => {
          debug!(task = %id, name = %record.name, attempt, "Task completed");
          record.settle(TaskStatus::Completed, Ok(value));
          events.push(TaskEvent::new(id, TaskEventType::Completed, &record.name, attempt));
          true
        }
        Err(err) => {
          // Any failure after a cancel request counts as the cancellation
          let err = if record.cancel.is_cancelled() {
            record.cancel.cancelled_error()
          } else {
            err
          };

          if let TaskError::Cancelled(reason) = &err {
            info!(task = %id, name = %record.name, reason = %reason, "Task cancelled");
            events.push(
              TaskEvent::new(id, TaskEventType::Cancelled, &record.name, attempt)
                .with_detail(reason.clone()),
            );
            abandoned = record.settle(TaskStatus::Cancelled, Err(err));
            true
          } else if !shutdown && self.config.retry.should_retry(attempt, record.max_retries, &err) {
            let delay = self.config.retry.delay_for(attempt);
            warn!(
              task = %id,
              name = %record.name,
              attempt,
              max_retries = record.max_retries,
              delay_ms = delay.as_millis() as u64,
              error = %err,
              "Task failed, retrying"
            );
            events.push(
              TaskEvent::new(id, TaskEventType::Failed, &record.name, attempt)
                .with_detail(err.to_string()),
            );
            events.push(
              TaskEvent::new(id, TaskEventType::Retried, &record.name, attempt)
                .with_detail(format!("{}ms", delay.as_millis())),
            );
            record.status = TaskStatus::Queued;
            record.delay = delay;
            let priority = record.priority;
            state.enqueue(id, priority, delay);
            false
          } else {
            error!(task = %id, name = %record.name, attempt, error = %err, "Task failed");
            events.push(
              TaskEvent::new(id, TaskEventType::Failed, &record.name, attempt)
                .with_detail(err.to_string()),
            );
            abandoned = record.settle(TaskStatus::Failed, Err(err));
            true
          }
        }
      };
      if settled {
        state.retire(id, self.config.max_finished_tasks);
      }
    }
    self.emit_all(events);
    self.abandon(abandoned.into_iter().collect());
  }
}

fn spawn_attempt(shared: Arc<Shared>, launch: Launch) {
  tokio::spawn(async move {
    let Launch { task, ctx } = launch;
    let outcome = AssertUnwindSafe(task.execute(&ctx))
      .catch_unwind()
      .await
      .unwrap_or_else(|_| Err(TaskError::fatal("task panicked")));
    shared.finish(ctx.task_id, ctx.attempt, outcome);
    shared.wake.notify_one();
  });
}

async fn run_scheduler(shared: Arc<Shared>) {
  loop {
    let Some((launches, events, next_delayed)) = shared.dispatch() else {
      break;
    };
    shared.emit_all(events);
    for launch in launches {
      spawn_attempt(Arc::clone(&shared), launch);
    }

    match next_delayed {
      Some(at) => {
        tokio::select! {
          _ = shared.wake.notified() => {}
          _ = tokio::time::sleep_until(at) => {}
        }
      }
      None => shared.wake.notified().await,
    }
  }
  debug!("Scheduler loop stopped");
}

/// Runs `BackgroundTask`s with bounded concurrency.
///
/// Submission and cancellation never block on running work; `wait_for_task`
/// only suspends its caller. Each task moves through
/// `queued -> running -> {completed | failed | cancelled}`, and a retryable
/// failure with budget left goes back to `queued` after a backoff delay.
pub struct BackgroundTaskExecutor {
  shared: Arc<Shared>,
  scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTaskExecutor {
  /// Start an executor. Must be called from within a tokio runtime.
  pub fn new(config: ExecutorConfig) -> Self {
    let shared = Arc::new(Shared {
      config,
      state: Mutex::new(State::default()),
      wake: Notify::new(),
      listeners: Listeners::new(),
    });
    let scheduler = tokio::spawn(run_scheduler(Arc::clone(&shared)));
    info!(
      max_concurrent_tasks = shared.config.max_concurrent_tasks,
      "Background task executor started"
    );
    Self {
      shared,
      scheduler: Mutex::new(Some(scheduler)),
    }
  }

  pub fn config(&self) -> &ExecutorConfig {
    &self.shared.config
  }

  /// Listener registry for lifecycle events.
  pub fn listeners(&self) -> &Listeners<TaskEvent> {
    &self.shared.listeners
  }

  /// Queue a task. Returns immediately; the scheduler runs it once `delay`
  /// has passed and a worker slot is free.
  pub fn submit_task(
    &self,
    task: Arc<dyn BackgroundTask>,
    priority: TaskPriority,
    delay: Option<Duration>,
  ) -> Result<TaskId, TaskError> {
    let delay = delay.unwrap_or_default();
    let event = {
      let mut state = self.shared.lock();
      if state.shutdown {
        return Err(TaskError::Shutdown);
      }
      state.next_id += 1;
      let id = TaskId(state.next_id);
      let name = task.name().to_string();
      let max_retries = task
        .max_retries()
        .unwrap_or(self.shared.config.default_max_retries);
      let (result, _) = watch::channel(None);

      debug!(
        task = %id,
        name = %name,
        ?priority,
        delay_ms = delay.as_millis() as u64,
        "Task submitted"
      );
      let event = TaskEvent::new(id, TaskEventType::Submitted, &name, 0);
      state.tasks.insert(
        id.0,
        TaskRecord {
          task: Some(task),
          name,
          priority,
          max_retries,
          attempt: 0,
          delay,
          status: TaskStatus::Queued,
          cancel: CancelHandle::new(),
          result,
        },
      );
      state.enqueue(id, priority, delay);
      event
    };
    self.shared.listeners.emit(&event);
    self.shared.wake.notify_one();
    Ok(event.task_id)
  }

  /// Submit with normal priority and no delay.
  pub fn submit<T: BackgroundTask + 'static>(&self, task: T) -> Result<TaskId, TaskError> {
    self.submit_task(Arc::new(task), TaskPriority::Normal, None)
  }

  /// Wait until the task reaches a terminal state and return its result.
  ///
  /// Only the newest `max_finished_tasks` settled tasks are remembered; older
  /// ids report `NotFound`.
  pub async fn wait_for_task(&self, id: TaskId) -> Result<TaskOutput, TaskError> {
    let mut rx = {
      let state = self.shared.lock();
      let record = state.tasks.get(&id.0).ok_or(TaskError::NotFound(id))?;
      record.result.subscribe()
    };
    let settled = rx
      .wait_for(|result| result.is_some())
      .await
      .map_err(|_| TaskError::Shutdown)?;
    settled.clone().unwrap_or(Err(TaskError::Shutdown))
  }

  /// Request cancellation.
  ///
  /// A queued task is cancelled on the spot. A running task only has its
  /// token set and stops when it next checks it. Returns false if the task
  /// had already finished.
  pub fn cancel_task(&self, id: TaskId, reason: &str) -> Result<bool, TaskError> {
    let (event, abandoned) = {
      let mut guard = self.shared.lock();
      let state = &mut *guard;
      let record = state.tasks.get_mut(&id.0).ok_or(TaskError::NotFound(id))?;
      match record.status {
        TaskStatus::Queued => {
          record.cancel.cancel(reason);
          let abandoned =
            record.settle(TaskStatus::Cancelled, Err(TaskError::Cancelled(reason.to_string())));
          info!(task = %id, reason, "Cancelled queued task");
          let event = TaskEvent::new(id, TaskEventType::Cancelled, &record.name, record.attempt)
            .with_detail(reason);
          state.retire(id, self.shared.config.max_finished_tasks);
          (Some(event), abandoned)
        }
        TaskStatus::Running => {
          record.cancel.cancel(reason);
          debug!(task = %id, reason, "Cancellation requested for running task");
          (None, None)
        }
        _ => return Ok(false),
      }
    };
    if let Some(event) = event {
      self.shared.listeners.emit(&event);
    }
    self.shared.abandon(abandoned.into_iter().collect());
    Ok(true)
  }

  pub fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
    self.shared.lock().tasks.get(&id.0).map(|record| record.status)
  }

  /// Attempts started so far for a task.
  pub fn attempts(&self, id: TaskId) -> Option<u32> {
    self.shared.lock().tasks.get(&id.0).map(|record| record.attempt)
  }

  /// Tasks waiting to run, including those waiting out a delay or backoff.
  pub fn queued_count(&self) -> usize {
    self
      .shared
      .lock()
      .tasks
      .values()
      .filter(|record| record.status == TaskStatus::Queued)
      .count()
  }

  pub fn running_count(&self) -> usize {
    self.shared.lock().running
  }

  /// Tasks the executor still tracks, finished ones included.
  pub fn tracked_count(&self) -> usize {
    self.shared.lock().tasks.len()
  }

  /// Drop bookkeeping for finished tasks. Returns how many were removed.
  pub fn clear_finished(&self) -> usize {
    let mut state = self.shared.lock();
    let before = state.tasks.len();
    state.tasks.retain(|_, record| !record.status.is_terminal());
    state.finished.clear();
    before - state.tasks.len()
  }

  /// Stop accepting work, cancel every queued task, signal running tasks to
  /// cancel and stop the scheduler loop.
  pub async fn shutdown(&self) {
    self.shared.stop();

    let handle = self
      .scheduler
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take();
    if let Some(handle) = handle {
      let _ = handle.await;
      info!("Background task executor shut down");
    }
  }
}

impl Drop for BackgroundTaskExecutor {
  fn drop(&mut self) {
    self.shared.stop();
    if let Some(handle) = self
      .scheduler
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take()
    {
      handle.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering as AtomicOrdering};

  fn fast_config(max_concurrent_tasks: usize) -> ExecutorConfig {
    ExecutorConfig {
      max_concurrent_tasks,
      retry: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5)),
      default_max_retries: 0,
      ..ExecutorConfig::default()
    }
  }

  struct Constant(i64);

  #[async_trait]
  impl BackgroundTask for Constant {
    async fn execute(&self, _ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
      Ok(serde_json::json!(self.0))
    }
  }

  struct AlwaysFails {
    attempts: Arc<AtomicU32>,
    retries: u32,
    fatal: bool,
  }

  #[async_trait]
  impl BackgroundTask for AlwaysFails {
    fn name(&self) -> &str {
      "always-fails"
    }

    fn max_retries(&self) -> Option<u32> {
      Some(self.retries)
    }

    async fn execute(&self, _ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
      self.attempts.fetch_add(1, AtomicOrdering::SeqCst);
      if self.fatal {
        Err(TaskError::fatal("rejected"))
      } else {
        Err(TaskError::failed("unreachable"))
      }
    }
  }

  struct FailsThenSucceeds {
    attempts: Arc<AtomicU32>,
    failures: u32,
  }

  #[async_trait]
  impl BackgroundTask for FailsThenSucceeds {
    fn max_retries(&self) -> Option<u32> {
      Some(5)
    }

    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
      self.attempts.fetch_add(1, AtomicOrdering::SeqCst);
      if ctx.attempt <= self.failures {
        Err(TaskError::failed("flaky"))
      } else {
        Ok(serde_json::json!(ctx.attempt))
      }
    }
  }

  /// Polls its token between short sleeps.
  struct Cooperative;

  #[async_trait]
  impl BackgroundTask for Cooperative {
    async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
      loop {
        ctx.check_cancelled()?;
        tokio::time::sleep(Duration::from_millis(2)).await;
      }
    }
  }

  /// Never looks at its token.
  struct Stubborn;

  #[async_trait]
  impl BackgroundTask for Stubborn {
    async fn execute(&self, _ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
      tokio::time::sleep(Duration::from_millis(40)).await;
      Ok(serde_json::json!("done"))
    }
  }

  struct Blocker(Arc<Notify>);

  #[async_trait]
  impl BackgroundTask for Blocker {
    async fn execute(&self, _ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
      self.0.notified().await;
      Ok(TaskOutput::Null)
    }
  }

  struct Recorder {
    label: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
  }

  #[async_trait]
  impl BackgroundTask for Recorder {
    async fn execute(&self, _ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
      self.log.lock().unwrap().push(self.label);
      Ok(TaskOutput::Null)
    }
  }

  struct Tracker {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
  }

  #[async_trait]
  impl BackgroundTask for Tracker {
    async fn execute(&self, _ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
      let now = self.current.fetch_add(1, AtomicOrdering::SeqCst) + 1;
      self.peak.fetch_max(now, AtomicOrdering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      self.current.fetch_sub(1, AtomicOrdering::SeqCst);
      Ok(TaskOutput::Null)
    }
  }

  struct Panics;

  #[async_trait]
  impl BackgroundTask for Panics {
    fn max_retries(&self) -> Option<u32> {
      Some(3)
    }

    async fn execute(&self, _ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
      panic!("task body exploded");
    }
  }

  /// Records what `on_abandoned` saw.
  struct Abandonable {
    fatal: bool,
    seen: Arc<Mutex<Vec<TaskError>>>,
  }

  #[async_trait]
  impl BackgroundTask for Abandonable {
    async fn execute(&self, _ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
      if self.fatal {
        Err(TaskError::fatal("rejected"))
      } else {
        Ok(TaskOutput::Null)
      }
    }

    fn on_abandoned(&self, error: &TaskError) {
      self.seen.lock().unwrap().push(error.clone());
    }
  }

  async fn wait_until_running(executor: &BackgroundTaskExecutor, id: TaskId) {
    while executor.task_status(id) != Some(TaskStatus::Running) {
      tokio::time::sleep(Duration::from_millis(1)).await;
    }
  }

  #[tokio::test]
  async fn test_task_completes_with_value() {
    let executor = BackgroundTaskExecutor::new(fast_config(2));
    let id = executor.submit(Constant(7)).unwrap();
    assert_eq!(executor.wait_for_task(id).await, Ok(serde_json::json!(7)));
    assert_eq!(executor.task_status(id), Some(TaskStatus::Completed));
  }

  #[tokio::test]
  async fn test_retry_budget_gives_three_attempts() {
    let executor = BackgroundTaskExecutor::new(fast_config(2));
    let (_, mut events) = executor.listeners().stream();
    let attempts = Arc::new(AtomicU32::new(0));
    let id = executor
      .submit(AlwaysFails {
        attempts: Arc::clone(&attempts),
        retries: 2,
        fatal: false,
      })
      .unwrap();

    let result = executor.wait_for_task(id).await;
    assert_eq!(result, Err(TaskError::failed("unreachable")));
    assert_eq!(attempts.load(AtomicOrdering::SeqCst), 3);
    assert_eq!(executor.attempts(id), Some(3));
    assert_eq!(executor.task_status(id), Some(TaskStatus::Failed));

    // Let the final event reach the stream
    tokio::time::sleep(Duration::from_millis(10)).await;
    let kinds: Vec<TaskEventType> = events.drain().into_iter().map(|e| e.event_type).collect();
    use TaskEventType::*;
    assert_eq!(
      kinds,
      vec![Submitted, Started, Failed, Retried, Started, Failed, Retried, Started, Failed]
    );
  }

  #[tokio::test]
  async fn test_retry_until_success() {
    let executor = BackgroundTaskExecutor::new(fast_config(1));
    let attempts = Arc::new(AtomicU32::new(0));
    let id = executor
      .submit(FailsThenSucceeds {
        attempts: Arc::clone(&attempts),
        failures: 2,
      })
      .unwrap();
    assert_eq!(executor.wait_for_task(id).await, Ok(serde_json::json!(3)));
    assert_eq!(attempts.load(AtomicOrdering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_fatal_failure_skips_retries() {
    let executor = BackgroundTaskExecutor::new(fast_config(1));
    let attempts = Arc::new(AtomicU32::new(0));
    let id = executor
      .submit(AlwaysFails {
        attempts: Arc::clone(&attempts),
        retries: 5,
        fatal: true,
      })
      .unwrap();
    assert_eq!(executor.wait_for_task(id).await, Err(TaskError::fatal("rejected")));
    assert_eq!(attempts.load(AtomicOrdering::SeqCst), 1);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_cancel_cooperative_running_task() {
    let executor = BackgroundTaskExecutor::new(fast_config(1));
    let id = executor.submit(Cooperative).unwrap();
    wait_until_running(&executor, id).await;

    assert!(executor.cancel_task(id, "user request").unwrap());
    assert_eq!(
      executor.wait_for_task(id).await,
      Err(TaskError::Cancelled("user request".into()))
    );
    assert_eq!(executor.task_status(id), Some(TaskStatus::Cancelled));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_task_ignoring_token_completes() {
    let executor = BackgroundTaskExecutor::new(fast_config(1));
    let id = executor.submit(Stubborn).unwrap();
    wait_until_running(&executor, id).await;

    assert!(executor.cancel_task(id, "too late").unwrap());
    assert_eq!(executor.wait_for_task(id).await, Ok(serde_json::json!("done")));
    assert_eq!(executor.task_status(id), Some(TaskStatus::Completed));
    // Already finished
    assert!(!executor.cancel_task(id, "again").unwrap());
  }

  #[tokio::test]
  async fn test_cancel_delayed_task_never_runs() {
    let executor = BackgroundTaskExecutor::new(fast_config(1));
    let log = Arc::new(Mutex::new(Vec::new()));
    let id = executor
      .submit_task(
        Arc::new(Recorder {
          label: "late",
          log: Arc::clone(&log),
        }),
        TaskPriority::Normal,
        Some(Duration::from_millis(30)),
      )
      .unwrap();
    assert_eq!(executor.queued_count(), 1);
    assert!(executor.cancel_task(id, "not needed").unwrap());
    assert_eq!(executor.task_status(id), Some(TaskStatus::Cancelled));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(executor.queued_count(), 0);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_priority_then_fifo_order() {
    let executor = BackgroundTaskExecutor::new(fast_config(1));
    let gate = Arc::new(Notify::new());
    let blocker = executor.submit(Blocker(Arc::clone(&gate))).unwrap();
    wait_until_running(&executor, blocker).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut ids = Vec::new();
    for (label, priority) in [
      ("low", TaskPriority::Low),
      ("normal-1", TaskPriority::Normal),
      ("critical", TaskPriority::Critical),
      ("normal-2", TaskPriority::Normal),
      ("high", TaskPriority::High),
    ] {
      let task = Recorder {
        label,
        log: Arc::clone(&log),
      };
      ids.push(executor.submit_task(Arc::new(task), priority, None).unwrap());
    }

    gate.notify_one();
    for id in ids {
      executor.wait_for_task(id).await.unwrap();
    }
    assert_eq!(
      *log.lock().unwrap(),
      vec!["critical", "high", "normal-1", "normal-2", "low"]
    );
  }

  #[tokio::test]
  async fn test_delay_is_respected() {
    let executor = BackgroundTaskExecutor::new(fast_config(1));
    let started = Instant::now();
    let id = executor
      .submit_task(Arc::new(Constant(1)), TaskPriority::High, Some(Duration::from_millis(50)))
      .unwrap();
    executor.wait_for_task(id).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrency_is_bounded() {
    let executor = BackgroundTaskExecutor::new(fast_config(2));
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let ids: Vec<TaskId> = (0..6)
      .map(|_| {
        executor
          .submit(Tracker {
            current: Arc::clone(&current),
            peak: Arc::clone(&peak),
          })
          .unwrap()
      })
      .collect();
    for id in ids {
      executor.wait_for_task(id).await.unwrap();
    }
    assert!(peak.load(AtomicOrdering::SeqCst) <= 2);
    assert_eq!(peak.load(AtomicOrdering::SeqCst), 2);
    assert_eq!(executor.running_count(), 0);
  }

  #[tokio::test]
  async fn test_panicking_task_fails_without_retry() {
    let executor = BackgroundTaskExecutor::new(fast_config(1));
    let id = executor.submit(Panics).unwrap();
    assert_eq!(
      executor.wait_for_task(id).await,
      Err(TaskError::fatal("task panicked"))
    );
    assert_eq!(executor.attempts(id), Some(1));
  }

  #[tokio::test]
  async fn test_shutdown_cancels_queued_and_rejects_new_work() {
    let executor = BackgroundTaskExecutor::new(fast_config(1));
    let id = executor
      .submit_task(Arc::new(Constant(1)), TaskPriority::Low, Some(Duration::from_secs(60)))
      .unwrap();
    executor.shutdown().await;

    assert_eq!(executor.task_status(id), Some(TaskStatus::Cancelled));
    assert!(matches!(executor.wait_for_task(id).await, Err(TaskError::Cancelled(_))));
    assert_eq!(executor.submit(Constant(2)), Err(TaskError::Shutdown));
  }

  #[tokio::test]
  async fn test_unknown_task() {
    let executor = BackgroundTaskExecutor::new(fast_config(1));
    assert_eq!(
      executor.wait_for_task(TaskId(99)).await,
      Err(TaskError::NotFound(TaskId(99)))
    );
    assert_eq!(
      executor.cancel_task(TaskId(99), "x"),
      Err(TaskError::NotFound(TaskId(99)))
    );
  }

  #[tokio::test]
  async fn test_clear_finished() {
    let executor = BackgroundTaskExecutor::new(fast_config(1));
    let id = executor.submit(Constant(1)).unwrap();
    executor.wait_for_task(id).await.unwrap();
    assert_eq!(executor.clear_finished(), 1);
    assert_eq!(executor.task_status(id), None);
  }

  #[tokio::test]
  async fn test_finished_records_are_bounded() {
    let executor = BackgroundTaskExecutor::new(ExecutorConfig {
      max_finished_tasks: 3,
      ..fast_config(1)
    });
    let mut ids = Vec::new();
    for i in 0..10 {
      let id = executor.submit(Constant(i)).unwrap();
      executor.wait_for_task(id).await.unwrap();
      ids.push(id);
    }

    assert_eq!(executor.tracked_count(), 3);
    assert_eq!(executor.task_status(ids[0]), None);
    assert_eq!(executor.task_status(ids[9]), Some(TaskStatus::Completed));
    assert_eq!(executor.wait_for_task(ids[9]).await, Ok(serde_json::json!(9)));
  }

  #[tokio::test]
  async fn test_settled_task_is_released() {
    let executor = BackgroundTaskExecutor::new(fast_config(1));
    let task = Arc::new(Constant(1));
    let id = executor
      .submit_task(task.clone(), TaskPriority::Normal, None)
      .unwrap();
    executor.wait_for_task(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(Arc::strong_count(&task), 1);
  }

  #[tokio::test]
  async fn test_abandon_hook_runs_for_failures_and_cancellations() {
    let executor = BackgroundTaskExecutor::new(fast_config(1));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let ok = executor
      .submit(Abandonable {
        fatal: false,
        seen: Arc::clone(&seen),
      })
      .unwrap();
    executor.wait_for_task(ok).await.unwrap();
    assert!(seen.lock().unwrap().is_empty());

    let failed = executor
      .submit(Abandonable {
        fatal: true,
        seen: Arc::clone(&seen),
      })
      .unwrap();
    let _ = executor.wait_for_task(failed).await;
    // The hook runs just after the result is published
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*seen.lock().unwrap(), vec![TaskError::fatal("rejected")]);

    let delayed = Arc::new(Abandonable {
      fatal: false,
      seen: Arc::clone(&seen),
    });
    executor
      .submit_task(delayed, TaskPriority::Normal, Some(Duration::from_secs(60)))
      .unwrap();
    executor.shutdown().await;
    assert_eq!(
      seen.lock().unwrap().last(),
      Some(&TaskError::Cancelled("executor shut down".to_string()))
    );
  }
}
