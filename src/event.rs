//! Observer fan-out for cache, task and status events.
//!
//! Listeners are plain callbacks. Each invocation is isolated: a panicking
//! listener is logged and skipped, it never reaches the emitter or the other
//! listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::warn;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handle returned by `Listeners::add`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A registry of event listeners.
pub struct Listeners<E> {
  next_id: AtomicU64,
  callbacks: RwLock<Vec<(ListenerId, Callback<E>)>>,
}

impl<E> Default for Listeners<E> {
  fn default() -> Self {
    Self {
      next_id: AtomicU64::new(0),
      callbacks: RwLock::new(Vec::new()),
    }
  }
}

impl<E> Listeners<E> {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a listener.
  pub fn add<F>(&self, callback: F) -> ListenerId
  where
    F: Fn(&E) + Send + Sync + 'static,
  {
    let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
    let mut callbacks = self
      .callbacks
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    callbacks.push((id, Arc::new(callback)));
    id
  }

  /// Remove a listener. Returns false if it was not registered.
  pub fn remove(&self, id: ListenerId) -> bool {
    let mut callbacks = self
      .callbacks
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    let before = callbacks.len();
    callbacks.retain(|(existing, _)| *existing != id);
    callbacks.len() != before
  }

  pub fn len(&self) -> usize {
    self
      .callbacks
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Deliver an event to every listener.
  pub fn emit(&self, event: &E) {
    // Clone the handles so listeners may add/remove listeners themselves
    let callbacks: Vec<Callback<E>> = self
      .callbacks
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .iter()
      .map(|(_, cb)| Arc::clone(cb))
      .collect();

    for callback in callbacks {
      if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        warn!("Event listener panicked; continuing with remaining listeners");
      }
    }
  }
}

impl<E: Clone + Send + 'static> Listeners<E> {
  /// Register a listener that forwards every event into an async stream.
  ///
  /// The listener stays registered until the stream is dropped and the next
  /// event fails to send; use `remove` with the returned id to detach eagerly.
  pub fn stream(&self) -> (ListenerId, EventStream<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.add(move |event: &E| {
      // Receiver may have been dropped
      let _ = tx.send(event.clone());
    });
    (id, EventStream { rx })
  }
}

/// Async receiver side of `Listeners::stream`.
pub struct EventStream<E> {
  rx: mpsc::UnboundedReceiver<E>,
}

impl<E> EventStream<E> {
  /// Receive the next event
  pub async fn next(&mut self) -> Option<E> {
    self.rx.recv().await
  }

  /// Drain whatever has been delivered so far without waiting.
  pub fn drain(&mut self) -> Vec<E> {
    let mut events = Vec::new();
    while let Ok(event) = self.rx.try_recv() {
      events.push(event);
    }
    events
  }
}
