//! Narrow interfaces over the durable storage collaborators: one record per
//! job ID in the Job Record Store, one append-only blob per job ID in the Log
//! Sink. The in-memory implementations are the defaults used by tests and
//! single-process deployments; a durable backend plugs in behind the same
//! traits.

use crate::error::StoreError;
use crate::job::{JobId, JobRecord};

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Durable key-value persistence for job records.
///
/// Must support safe concurrent read/write per job ID; the tracker guarantees
/// that writes for the same ID never race each other.
#[async_trait]
pub trait JobStore: Send + Sync {
  async fn create(&self, record: &JobRecord) -> Result<(), StoreError>;
  async fn read(&self, id: &str) -> Result<Option<JobRecord>, StoreError>;
  async fn update(&self, record: &JobRecord) -> Result<(), StoreError>;
  /// Full scan, used for restart reconciliation and aggregate stats.
  async fn list(&self) -> Result<Vec<JobRecord>, StoreError>;
}

/// Per-job append-only text storage, retrievable by job identifier.
#[async_trait]
pub trait LogSink: Send + Sync {
  async fn append(&self, job_id: &str, line: &str) -> Result<(), StoreError>;
  async fn read(&self, job_id: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// In-memory `JobStore` backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
  records: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl JobStore for MemoryJobStore {
  async fn create(&self, record: &JobRecord) -> Result<(), StoreError> {
    let mut records = self.records.write().await;
    records.insert(record.id.clone(), record.clone());
    Ok(())
  }

  async fn read(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
    let records = self.records.read().await;
    Ok(records.get(id).cloned())
  }

  async fn update(&self, record: &JobRecord) -> Result<(), StoreError> {
    let mut records = self.records.write().await;
    match records.get_mut(&record.id) {
      Some(existing) => {
        *existing = record.clone();
        Ok(())
      }
      None => Err(StoreError::Backend(format!(
        "update of unknown record {}",
        record.id
      ))),
    }
  }

  async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
    let records = self.records.read().await;
    Ok(records.values().cloned().collect())
  }
}

/// In-memory `LogSink` keeping one growable byte buffer per job ID.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
  blobs: RwLock<HashMap<JobId, Vec<u8>>>,
}

impl MemoryLogSink {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl LogSink for MemoryLogSink {
  async fn append(&self, job_id: &str, line: &str) -> Result<(), StoreError> {
    let mut blobs = self.blobs.write().await;
    blobs
      .entry(job_id.to_string())
      .or_default()
      .extend_from_slice(line.as_bytes());
    Ok(())
  }

  async fn read(&self, job_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
    let blobs = self.blobs.read().await;
    Ok(blobs.get(job_id).cloned())
  }
}
