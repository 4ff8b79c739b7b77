use crate::error::{OpError, StoreError};
use crate::job::{JobId, JobParameters};
use crate::state::StatusTracker;
use crate::store::LogSink;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure reported by a job implementation. The text is captured into the
/// record's terminal `Error` state (or consumed by the retry policy); it is
/// never thrown past the worker boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct RunError(pub String);

impl RunError {
  pub fn msg(text: impl Into<String>) -> Self {
    RunError(text.into())
  }
}

/// Execution context handed to a job implementation for one run.
///
/// Carries the cooperative cancellation token, the per-job log handle, and
/// the check-in channel. Implementations must poll [`RunContext::is_cancelled`]
/// (or await [`RunContext::cancelled`]) at natural suspension points; there is
/// no hard preemption.
#[derive(Clone)]
pub struct RunContext {
  job_id: JobId,
  cancel: CancellationToken,
  tracker: Arc<StatusTracker>,
  log_sink: Arc<dyn LogSink>,
}

impl RunContext {
  pub(crate) fn new(
    job_id: JobId,
    cancel: CancellationToken,
    tracker: Arc<StatusTracker>,
    log_sink: Arc<dyn LogSink>,
  ) -> Self {
    Self {
      job_id,
      cancel,
      tracker,
      log_sink,
    }
  }

  pub fn job_id(&self) -> &JobId {
    &self.job_id
  }

  /// True once a stop/cancel request has been delivered for this run.
  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Resolves when a stop/cancel request is delivered. Useful inside
  /// `tokio::select!` against the job's own work.
  pub async fn cancelled(&self) {
    self.cancel.cancelled().await;
  }

  /// Reports a free-text progress note. Persisted on the record and included
  /// in the next webhook payload. A no-op once the record is terminal.
  pub async fn check_in(&self, message: &str) -> Result<(), OpError> {
    self.tracker.check_in(&self.job_id, message).await
  }

  /// Appends a timestamped line to the job's log blob.
  pub async fn log(&self, line: &str) -> Result<(), StoreError> {
    let stamped = format!("{} {}\n", Utc::now().to_rfc3339(), line);
    self.log_sink.append(&self.job_id, &stamped).await
  }
}

/// The execution capability implemented by each job type.
///
/// Implementations are supplied by the embedding application, registered in a
/// [`JobRegistry`] once at process start, and injected into the worker pool.
/// `Ok(())` marks the run successful; `Err` feeds the retry policy.
#[async_trait]
pub trait JobRunner: Send + Sync {
  async fn run(&self, ctx: RunContext, params: JobParameters) -> Result<(), RunError>;
}

/// Mapping from job-type identifier to its runner.
///
/// Populated once at startup and passed to the controller builder by
/// dependency injection; never reached through ambient global state.
#[derive(Default)]
pub struct JobRegistry {
  runners: HashMap<String, Arc<dyn JobRunner>>,
}

impl JobRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a runner under its job-type name. Later registrations replace
  /// earlier ones for the same name.
  pub fn register(&mut self, name: &str, runner: Arc<dyn JobRunner>) -> &mut Self {
    self.runners.insert(name.to_string(), runner);
    self
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn JobRunner>> {
    self.runners.get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.runners.contains_key(name)
  }
}

impl std::fmt::Debug for JobRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("JobRegistry")
      .field("job_types", &self.runners.keys().collect::<Vec<_>>())
      .finish()
  }
}
