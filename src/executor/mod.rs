//! Background task executor: prioritized, delayed, retryable and
//! cooperatively cancellable asynchronous work.

mod cancel;
mod retry;
mod scheduler;
mod task;

pub use cancel::CancelHandle;
pub use retry::RetryPolicy;
pub use scheduler::{BackgroundTaskExecutor, ExecutorConfig};
pub use task::{
  BackgroundTask, TaskContext, TaskError, TaskEvent, TaskEventType, TaskId, TaskOutput,
  TaskPriority, TaskStatus,
};
