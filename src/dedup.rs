//! Submission deduplication.
//!
//! A fingerprint is derived from the job name plus the normalized parameter
//! map; the deduplicator enforces at most one in-flight job per fingerprint
//! within its namespace by atomically creating a uniqueness marker with a TTL.
//! The marker backend must provide check-and-set semantics (SETNX-style); no
//! separate check-then-act is permitted.

use crate::error::{DedupError, StoreError};
use crate::job::{JobKind, JobParameters};

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Atomic check-and-set storage for uniqueness markers.
///
/// `try_put` must atomically create the marker if absent and report whether
/// creation happened. Backends with native expiry need no sweeping; the
/// in-memory implementation reaps lazily.
#[async_trait]
pub trait MarkerStore: Send + Sync {
  /// Returns `Ok(true)` if the marker was created, `Ok(false)` if it already
  /// exists (and has not expired).
  async fn try_put(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
  async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory marker store: a single mutex makes check-and-set atomic.
#[derive(Debug, Default)]
pub struct MemoryMarkerStore {
  markers: Mutex<HashMap<String, Instant>>,
}

impl MemoryMarkerStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
  async fn try_put(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
    let mut markers = self.markers.lock();
    let now = Instant::now();
    if let Some(expiry) = markers.get(key) {
      if *expiry > now {
        return Ok(false);
      }
      // Expired marker; fall through and replace it.
    }
    markers.insert(key.to_string(), now + ttl);
    Ok(true)
  }

  async fn delete(&self, key: &str) -> Result<(), StoreError> {
    self.markers.lock().remove(key);
    Ok(())
  }
}

/// Maps a record kind to the name under which its marker is held.
///
/// A periodic definition and the instances it spawns share `name` and
/// `parameters`; scoping the definition separately lets each firing dedupe
/// against still-running siblings (and identical ad-hoc submissions) without
/// colliding with the standing definition record itself.
pub(crate) fn scoped_name(name: &str, kind: JobKind) -> String {
  match kind {
    JobKind::Periodic => format!("{name}@definition"),
    JobKind::Generic | JobKind::ScheduledInstance => name.to_string(),
  }
}

/// Computes the deterministic fingerprint for a `(name, parameters)` pair
/// within a namespace. The parameter map is keyed by `BTreeMap`, so its JSON
/// rendering is canonical without extra sorting.
pub fn fingerprint(namespace: &str, name: &str, parameters: &JobParameters) -> String {
  let params_json = serde_json::to_string(parameters).unwrap_or_default();
  let mut hasher = Sha256::new();
  hasher.update(namespace.as_bytes());
  hasher.update(b":");
  hasher.update(name.as_bytes());
  hasher.update(b":");
  hasher.update(params_json.as_bytes());
  hex::encode(hasher.finalize())
}

/// Enforces the dedup invariant for one namespace.
///
/// `acquire` fails closed: if the marker backend is unreachable the
/// submission is refused rather than risking a silent duplicate.
pub struct Deduplicator {
  namespace: String,
  ttl: Duration,
  markers: std::sync::Arc<dyn MarkerStore>,
}

impl Deduplicator {
  /// `ttl` must exceed any plausible job runtime so the marker cannot expire
  /// while the job is still executing.
  pub fn new(namespace: &str, ttl: Duration, markers: std::sync::Arc<dyn MarkerStore>) -> Self {
    Self {
      namespace: namespace.to_string(),
      ttl,
      markers,
    }
  }

  /// Attempts to claim the uniqueness marker for this submission.
  /// Returns the fingerprint on success so callers can log/propagate it.
  pub async fn acquire(
    &self,
    name: &str,
    parameters: &JobParameters,
  ) -> Result<String, DedupError> {
    let fp = fingerprint(&self.namespace, name, parameters);
    if self.markers.try_put(&fp, self.ttl).await? {
      tracing::debug!(fingerprint = %fp, job_name = %name, "Acquired uniqueness marker.");
      Ok(fp)
    } else {
      tracing::debug!(fingerprint = %fp, job_name = %name, "Uniqueness marker already held.");
      Err(DedupError::Duplicate(fp))
    }
  }

  /// Removes the marker once the owning job reaches a terminal state (or
  /// failed to enqueue), so an identical resubmission is accepted again.
  pub async fn release(&self, name: &str, parameters: &JobParameters) -> Result<(), StoreError> {
    let fp = fingerprint(&self.namespace, name, parameters);
    self.markers.delete(&fp).await?;
    tracing::debug!(fingerprint = %fp, job_name = %name, "Released uniqueness marker.");
    Ok(())
  }
}

impl std::fmt::Debug for Deduplicator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Deduplicator")
      .field("namespace", &self.namespace)
      .field("ttl", &self.ttl)
      .finish()
  }
}
