//! Task model: identifiers, priorities, lifecycle states and errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::cancel::CancelHandle;

/// Value produced by a successful task.
pub type TaskOutput = serde_json::Value;

/// Identifier handed back by `submit_task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "task-{}", self.0)
  }
}

/// Scheduling priority. Higher variants are dequeued first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
  Low,
  #[default]
  Normal,
  High,
  Critical,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Queued,
  Running,
  Completed,
  Failed,
  Cancelled,
}

impl TaskStatus {
  pub fn state_name(&self) -> &'static str {
    match self {
      TaskStatus::Queued => "queued",
      TaskStatus::Running => "running",
      TaskStatus::Completed => "completed",
      TaskStatus::Failed => "failed",
      TaskStatus::Cancelled => "cancelled",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
    )
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.state_name())
  }
}

/// Task failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
  /// Failure that may succeed on another attempt
  #[error("Task failed: {0}")]
  Failed(String),

  /// Failure that retrying cannot fix
  #[error("Task failed permanently: {0}")]
  Fatal(String),

  #[error("Task cancelled: {0}")]
  Cancelled(String),

  #[error("Unknown task: {0}")]
  NotFound(TaskId),

  #[error("Executor is shut down")]
  Shutdown,
}

impl TaskError {
  pub fn failed<E: fmt::Display>(e: E) -> Self {
    Self::Failed(e.to_string())
  }

  pub fn fatal<E: fmt::Display>(e: E) -> Self {
    Self::Fatal(e.to_string())
  }

  pub fn is_retryable(&self) -> bool {
    matches!(self, TaskError::Failed(_))
  }
}

/// A unit of asynchronous work run by the `BackgroundTaskExecutor`.
///
/// Cancellation is cooperative: long-running bodies should call
/// `ctx.check_cancelled()` at safe points. A body that never checks runs to
/// completion even after `cancel_task`.
#[async_trait]
pub trait BackgroundTask: Send + Sync {
  /// Short label used in logs and events.
  fn name(&self) -> &str {
    "task"
  }

  /// Retries after the first attempt. `None` uses the executor default.
  fn max_retries(&self) -> Option<u32> {
    None
  }

  async fn execute(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError>;

  /// Called once, outside the scheduler lock, when the task settles as
  /// failed or cancelled. Also runs for tasks cancelled before they started.
  fn on_abandoned(&self, _error: &TaskError) {}
}

/// Per-attempt execution context passed to `BackgroundTask::execute`.
#[derive(Debug, Clone)]
pub struct TaskContext {
  pub task_id: TaskId,
  /// 1-based attempt number
  pub attempt: u32,
  pub max_retries: u32,
  /// Delay the task waited before becoming eligible for this attempt
  pub delay: Duration,
  cancel: CancelHandle,
}

impl TaskContext {
  pub(crate) fn new(
    task_id: TaskId,
    attempt: u32,
    max_retries: u32,
    delay: Duration,
    cancel: CancelHandle,
  ) -> Self {
    Self {
      task_id,
      attempt,
      max_retries,
      delay,
      cancel,
    }
  }

  pub fn is_final_attempt(&self) -> bool {
    self.attempt > self.max_retries
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// `Err(TaskError::Cancelled)` once cancellation was requested.
  pub fn check_cancelled(&self) -> Result<(), TaskError> {
    self.cancel.check()
  }

  /// Resolves when cancellation is requested.
  pub async fn cancelled(&self) {
    self.cancel.cancelled().await
  }
}

/// Kinds of lifecycle transitions reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskEventType {
  Submitted,
  Started,
  Completed,
  Failed,
  Cancelled,
  Retried,
}

/// One lifecycle transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
  pub task_id: TaskId,
  pub event_type: TaskEventType,
  pub task_name: String,
  pub attempt: u32,
  pub at: DateTime<Utc>,
  /// Error text for failures, reason for cancellations, delay for retries
  pub detail: Option<String>,
}

impl TaskEvent {
  pub(crate) fn new(
    task_id: TaskId,
    event_type: TaskEventType,
    task_name: &str,
    attempt: u32,
  ) -> Self {
    Self {
      task_id,
      event_type,
      task_name: task_name.to_string(),
      attempt,
      at: Utc::now(),
      detail: None,
    }
  }

  pub(crate) fn with_detail(mut self, detail: impl Into<String>) -> Self {
    self.detail = Some(detail.into());
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_priority_total_order() {
    assert!(TaskPriority::Critical > TaskPriority::High);
    assert!(TaskPriority::High > TaskPriority::Normal);
    assert!(TaskPriority::Normal > TaskPriority::Low);
    assert_eq!(TaskPriority::default(), TaskPriority::Normal);
  }

  #[test]
  fn test_terminal_states() {
    assert!(!TaskStatus::Queued.is_terminal());
    assert!(!TaskStatus::Running.is_terminal());
    assert!(TaskStatus::Completed.is_terminal());
    assert!(TaskStatus::Failed.is_terminal());
    assert!(TaskStatus::Cancelled.is_terminal());
    assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
  }

  #[test]
  fn test_only_plain_failures_retry() {
    assert!(TaskError::failed("timeout").is_retryable());
    assert!(!TaskError::fatal("bad request").is_retryable());
    assert!(!TaskError::Cancelled("user".into()).is_retryable());
  }

  #[test]
  fn test_final_attempt() {
    let ctx = TaskContext::new(TaskId(1), 3, 2, Duration::ZERO, CancelHandle::new());
    assert!(ctx.is_final_attempt());
    let ctx = TaskContext::new(TaskId(1), 2, 2, Duration::ZERO, CancelHandle::new());
    assert!(!ctx.is_final_attempt());
  }
}
