//! The job lifecycle state machine and its owner, the `StatusTracker`.
//!
//! Every transition is validated against the edge table, persisted through
//! the Job Record Store before being considered committed, and followed by a
//! non-blocking webhook notification carrying the bumped revision counter.
//! Transitions for the same job ID are serialized; different IDs proceed in
//! parallel.

use crate::dedup::{scoped_name, Deduplicator};
use crate::error::{OpError, StoreError};
use crate::hooks::{HookEvent, HookPayload, WebhookNotifier};
use crate::job::{JobId, JobRecord, JobState};
use crate::store::JobStore;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// The allowed-edges table.
///
/// ```text
/// Pending  -> Running | Stopped | Cancelled | Error
/// Running  -> Success | Error | Stopped | Retrying
/// Retrying -> Pending
/// Error    -> Pending          (explicit operator retry only)
/// ```
/// `Success`, `Stopped`, and `Cancelled` admit nothing. `Pending -> Error`
/// exists solely so an enqueue failure can park the record instead of losing
/// it.
pub fn transition_allowed(from: JobState, to: JobState) -> bool {
  use JobState::*;
  matches!(
    (from, to),
    (Pending, Running)
      | (Pending, Stopped)
      | (Pending, Cancelled)
      | (Pending, Error)
      | (Running, Success)
      | (Running, Error)
      | (Running, Stopped)
      | (Running, Retrying)
      | (Retrying, Pending)
      | (Error, Pending)
  )
}

/// Owns all job record mutation.
///
/// Created once by the controller builder and shared (via `Arc`) with the
/// worker pool and run contexts.
pub struct StatusTracker {
  store: Arc<dyn JobStore>,
  dedup: Arc<Deduplicator>,
  notifier: WebhookNotifier,
  // One async mutex per in-flight job ID. Entries are dropped once the
  // record goes terminal to keep the map bounded by active jobs.
  guards: Mutex<HashMap<JobId, Arc<Mutex<()>>>>,
}

impl StatusTracker {
  pub(crate) fn new(
    store: Arc<dyn JobStore>,
    dedup: Arc<Deduplicator>,
    notifier: WebhookNotifier,
  ) -> Self {
    Self {
      store,
      dedup,
      notifier,
      guards: Mutex::new(HashMap::new()),
    }
  }

  async fn guard_for(&self, id: &JobId) -> Arc<Mutex<()>> {
    let mut guards = self.guards.lock().await;
    guards.entry(id.clone()).or_default().clone()
  }

  /// Reads the current record for a job ID.
  pub async fn get(&self, id: &JobId) -> Result<JobRecord, OpError> {
    self
      .store
      .read(id)
      .await?
      .ok_or_else(|| OpError::NotFound(id.clone()))
  }

  /// Persists a freshly built `Pending` record and emits the creation
  /// notification (revision 1).
  pub(crate) async fn create_pending(&self, record: &JobRecord) -> Result<(), StoreError> {
    self.store.create(record).await?;
    debug!(job_id = %record.id, job_name = %record.name, "Created pending job record.");
    self.emit_hook(record);
    Ok(())
  }

  /// Applies a plain state transition.
  pub async fn transition(&self, id: &JobId, to: JobState) -> Result<JobRecord, OpError> {
    self.transition_with(id, to, |_| {}).await
  }

  /// Applies a state transition with an extra record mutation (retry count,
  /// error text, ...) folded into the same commit.
  pub(crate) async fn transition_with<F>(
    &self,
    id: &JobId,
    to: JobState,
    mutate: F,
  ) -> Result<JobRecord, OpError>
  where
    F: FnOnce(&mut JobRecord),
  {
    let guard = self.guard_for(id).await;
    let _serialized = guard.lock().await;

    let mut record = self.get(id).await?;
    let from = record.state;
    if !transition_allowed(from, to) {
      return Err(OpError::InvalidTransition {
        id: id.clone(),
        from,
        to,
      });
    }

    record.state = to;
    record.revision += 1;
    record.sequence += 1;
    record.update_time = Utc::now();
    mutate(&mut record);

    self.store.update(&record).await?;
    debug!(
      job_id = %record.id,
      ?from,
      ?to,
      revision = record.revision,
      "Committed state transition."
    );
    self.emit_hook(&record);

    if to.is_terminal() {
      self.on_terminal(&record).await;
    }
    Ok(record)
  }

  /// Records a progress note without a state transition. The revision is not
  /// bumped (only the sequence counter moves, so the immediate hook is still
  /// distinguishable from the preceding transition's); the note also rides
  /// along on the next transition's hook payload. A no-op for terminal
  /// records.
  pub(crate) async fn check_in(&self, id: &JobId, message: &str) -> Result<(), OpError> {
    let guard = self.guard_for(id).await;
    let _serialized = guard.lock().await;

    let mut record = self.get(id).await?;
    if record.state.is_terminal() {
      debug!(job_id = %id, "Ignoring check-in on terminal record.");
      return Ok(());
    }
    record.check_in = Some(message.to_string());
    record.sequence += 1;
    record.update_time = Utc::now();
    self.store.update(&record).await?;
    self.emit_hook(&record);
    Ok(())
  }

  /// Restart reconciliation: a `Running`/`Retrying` record left over from a
  /// previous process generation has lost its in-memory execution context and
  /// is non-resumable. Forced into `Error` outside the normal edge table.
  pub(crate) async fn mark_orphaned(&self, id: &JobId) -> Result<(), OpError> {
    let guard = self.guard_for(id).await;
    let _serialized = guard.lock().await;

    let mut record = self.get(id).await?;
    if !matches!(record.state, JobState::Running | JobState::Retrying) {
      return Ok(());
    }
    let from = record.state;
    record.state = JobState::Error;
    record.revision += 1;
    record.sequence += 1;
    record.update_time = Utc::now();
    record.error = Some("orphaned by process restart".to_string());
    self.store.update(&record).await?;
    warn!(job_id = %id, ?from, "Reconciled orphaned record to Error.");
    self.emit_hook(&record);
    self.on_terminal(&record).await;
    Ok(())
  }

  fn emit_hook(&self, record: &JobRecord) {
    if let Some(hook_url) = &record.status_hook {
      self.notifier.notify(HookEvent {
        hook_url: hook_url.clone(),
        payload: HookPayload {
          job_id: record.id.clone(),
          state: record.state,
          revision: record.revision,
          sequence: record.sequence,
          check_in: record.check_in.clone(),
          timestamp: record.update_time,
        },
      });
    }
  }

  /// Terminal-state housekeeping: free the dedup marker so an identical
  /// resubmission is accepted, and drop the per-ID guard entry.
  async fn on_terminal(&self, record: &JobRecord) {
    let name = scoped_name(&record.name, record.kind);
    if let Err(e) = self.dedup.release(&name, &record.parameters).await {
      warn!(job_id = %record.id, error = %e, "Failed to release uniqueness marker.");
    }
    self.guards.lock().await.remove(&record.id);
  }
}

impl std::fmt::Debug for StatusTracker {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StatusTracker").finish_non_exhaustive()
  }
}
