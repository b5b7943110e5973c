//! In-memory transport for sync tests.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::transport::{RemoteRecord, RemoteTransport, TransportError};

#[derive(Default)]
pub(crate) struct MemoryTransport {
  records: Mutex<HashMap<(String, String), RemoteRecord>>,
  /// Scripted outcomes for the next calls, front first; `None` lets a call through
  script: Mutex<VecDeque<Option<TransportError>>>,
  calls: Mutex<Vec<String>>,
}

impl MemoryTransport {
  pub fn insert(&self, collection: &str, record: RemoteRecord) {
    self
      .records
      .lock()
      .unwrap()
      .insert((collection.to_string(), record.id.clone()), record);
  }

  pub fn record(&self, collection: &str, id: &str) -> Option<RemoteRecord> {
    self
      .records
      .lock()
      .unwrap()
      .get(&(collection.to_string(), id.to_string()))
      .cloned()
  }

  pub fn fail_next(&self, error: TransportError) {
    self.script.lock().unwrap().push_back(Some(error));
  }

  pub fn pass_next(&self) {
    self.script.lock().unwrap().push_back(None);
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  fn enter(&self, call: String) -> Result<(), TransportError> {
    self.calls.lock().unwrap().push(call);
    match self.script.lock().unwrap().pop_front() {
      Some(Some(error)) => Err(error),
      _ => Ok(()),
    }
  }

  fn put(&self, collection: &str, id: &str, payload: &Value) -> RemoteRecord {
    let record = RemoteRecord {
      id: id.to_string(),
      payload: payload.clone(),
      modified_at: Utc::now(),
    };
    self.insert(collection, record.clone());
    record
  }
}

#[async_trait]
impl RemoteTransport for MemoryTransport {
  async fn get(&self, collection: &str, id: &str) -> Result<Option<RemoteRecord>, TransportError> {
    self.enter(format!("get {}/{}", collection, id))?;
    Ok(self.record(collection, id))
  }

  async fn list(&self, collection: &str) -> Result<Vec<RemoteRecord>, TransportError> {
    self.enter(format!("list {}", collection))?;
    Ok(
      self
        .records
        .lock()
        .unwrap()
        .iter()
        .filter(|((c, _), _)| c == collection)
        .map(|(_, record)| record.clone())
        .collect(),
    )
  }

  async fn create(
    &self,
    collection: &str,
    id: &str,
    payload: &Value,
  ) -> Result<RemoteRecord, TransportError> {
    self.enter(format!("create {}/{}", collection, id))?;
    Ok(self.put(collection, id, payload))
  }

  async fn update(
    &self,
    collection: &str,
    id: &str,
    payload: &Value,
  ) -> Result<RemoteRecord, TransportError> {
    self.enter(format!("update {}/{}", collection, id))?;
    Ok(self.put(collection, id, payload))
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<(), TransportError> {
    self.enter(format!("delete {}/{}", collection, id))?;
    self
      .records
      .lock()
      .unwrap()
      .remove(&(collection.to_string(), id.to_string()));
    Ok(())
  }
}
