pub mod runner;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Public Type Aliases ---

/// Opaque unique identifier of a job record. Assigned at submission, never
/// reused. Hyphen-free UUID v4 hex, so it is always safe to use as a storage
/// key (no path-like characters).
pub type JobId = String;

/// Job-type-specific parameters: string keys mapped to opaque JSON values.
/// `BTreeMap` keeps key order deterministic for fingerprinting.
pub type JobParameters = BTreeMap<String, serde_json::Value>;

/// Generates a fresh job identifier.
pub(crate) fn new_job_id() -> JobId {
  Uuid::new_v4().simple().to_string()
}

// --- Kinds, states, policies ---

/// Classifies how a job entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
  /// Ad-hoc one-off job.
  Generic,
  /// A standing cron definition. The record represents the definition itself;
  /// each firing spawns a separate `ScheduledInstance` record.
  Periodic,
  /// A single instance spawned by a periodic definition.
  ScheduledInstance,
}

/// Lifecycle state of a job record.
///
/// Transitions are validated and applied exclusively by the
/// [`StatusTracker`](crate::state::StatusTracker); see `state::transition_allowed`
/// for the edge table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
  Pending,
  Running,
  Retrying,
  Success,
  Error,
  Stopped,
  Cancelled,
}

impl JobState {
  /// Terminal states admit no further transitions (the sole exception being
  /// an explicit operator retry out of `Error`).
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      JobState::Success | JobState::Error | JobState::Stopped | JobState::Cancelled
    )
  }
}

/// Retry policy carried in the job metadata.
///
/// `max_retries == 0` means a failed execution goes straight to `Error`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
  pub max_retries: u32,
}

/// Control actions a boundary adapter can request on an existing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
  Stop,
  Cancel,
  Retry,
}

impl JobAction {
  /// Parses a wire-level action name. Unknown names are rejected by the
  /// controller with `UnsupportedAction` so the adapter can answer
  /// not-implemented.
  pub fn parse(name: &str) -> Option<Self> {
    match name {
      "stop" => Some(JobAction::Stop),
      "cancel" => Some(JobAction::Cancel),
      "retry" => Some(JobAction::Retry),
      _ => None,
    }
  }
}

// --- Request / record ---

/// Scheduling metadata attached to a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
  /// One-off vs periodic. Defaults to `Generic`.
  pub kind: Option<JobKind>,
  /// Cron expression; required when `kind` is `Periodic`, ignored otherwise.
  pub cron: Option<String>,
  /// Retry budget for failed executions.
  #[serde(default)]
  pub retry: RetryPolicy,
}

/// Caller-supplied job submission. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
  /// Job type identifier, resolved against the registered runner table.
  pub name: String,
  /// Job-type-specific parameters.
  #[serde(default)]
  pub parameters: JobParameters,
  #[serde(default)]
  pub metadata: JobMetadata,
  /// Optional callback URL notified on every state change.
  pub status_hook: Option<String>,
}

impl JobRequest {
  /// Creates an ad-hoc (one-off) job request.
  pub fn generic(name: &str) -> Self {
    Self {
      name: name.to_string(),
      parameters: JobParameters::new(),
      metadata: JobMetadata::default(),
      status_hook: None,
    }
  }

  /// Creates a periodic job request with the given cron expression
  /// (seconds-resolution format of the `cron` crate, UTC).
  pub fn periodic(name: &str, cron: &str) -> Self {
    Self {
      name: name.to_string(),
      parameters: JobParameters::new(),
      metadata: JobMetadata {
        kind: Some(JobKind::Periodic),
        cron: Some(cron.to_string()),
        retry: RetryPolicy::default(),
      },
      status_hook: None,
    }
  }

  pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
    self.parameters.insert(key.to_string(), value.into());
    self
  }

  pub fn with_status_hook(mut self, url: &str) -> Self {
    self.status_hook = Some(url.to_string());
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.metadata.retry.max_retries = max_retries;
    self
  }

  /// Effective kind of this request (`Generic` when unspecified).
  pub fn kind(&self) -> JobKind {
    self.metadata.kind.unwrap_or(JobKind::Generic)
  }
}

/// Server-owned job record persisted in the Job Record Store.
///
/// Owned exclusively by the Status Tracker; all mutation goes through it.
/// Records are never physically deleted by the core itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
  pub id: JobId,
  pub name: String,
  pub parameters: JobParameters,
  pub kind: JobKind,
  pub state: JobState,
  /// Monotonically increasing per-record counter, bumped on every state
  /// transition. Lets webhook receivers discard stale/duplicate callbacks.
  pub revision: u64,
  /// Counts every emitted status event, check-ins included. Unlike
  /// `revision` it also moves on non-transition events, so each webhook
  /// callback carries a distinct `(id, sequence)` pair.
  pub sequence: u64,
  /// Number of retry attempts consumed so far.
  pub retry_count: u32,
  /// Retry budget captured from the request metadata at submission, so the
  /// worker can apply the policy without re-reading the original request.
  pub max_retries: u32,
  /// Free-text progress note reported by the running job via check-in.
  pub check_in: Option<String>,
  /// Terminal error text when `state == Error`.
  pub error: Option<String>,
  pub creation_time: DateTime<Utc>,
  pub update_time: DateTime<Utc>,
  pub enqueue_time: Option<DateTime<Utc>>,
  pub status_hook: Option<String>,
  /// ID of the periodic definition that spawned this record, for
  /// `ScheduledInstance` kinds.
  pub upstream_id: Option<JobId>,
}

impl JobRecord {
  /// Builds a fresh `Pending` record from a submission. Revision starts at 1
  /// (creation counts as the first observable state).
  pub(crate) fn from_request(request: &JobRequest) -> Self {
    let now = Utc::now();
    Self {
      id: new_job_id(),
      name: request.name.clone(),
      parameters: request.parameters.clone(),
      kind: request.kind(),
      state: JobState::Pending,
      revision: 1,
      sequence: 1,
      retry_count: 0,
      max_retries: request.metadata.retry.max_retries,
      check_in: None,
      error: None,
      creation_time: now,
      update_time: now,
      enqueue_time: Some(now),
      status_hook: request.status_hook.clone(),
      upstream_id: None,
    }
  }
}

/// Point-in-time public snapshot of a job record, returned by `launch_job`
/// and `get_job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
  pub id: JobId,
  pub name: String,
  pub kind: JobKind,
  pub state: JobState,
  pub revision: u64,
  pub retry_count: u32,
  pub check_in: Option<String>,
  pub error: Option<String>,
  pub creation_time: DateTime<Utc>,
  pub update_time: DateTime<Utc>,
  pub enqueue_time: Option<DateTime<Utc>>,
  pub upstream_id: Option<JobId>,
}

impl From<&JobRecord> for JobStats {
  fn from(r: &JobRecord) -> Self {
    Self {
      id: r.id.clone(),
      name: r.name.clone(),
      kind: r.kind,
      state: r.state,
      revision: r.revision,
      retry_count: r.retry_count,
      check_in: r.check_in.clone(),
      error: r.error.clone(),
      creation_time: r.creation_time,
      update_time: r.update_time,
      enqueue_time: r.enqueue_time,
      upstream_id: r.upstream_id.clone(),
    }
  }
}

/// Aggregate counts per state plus worker utilization, for liveness/health
/// reporting via `check_status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
  pub pending: usize,
  pub running: usize,
  pub retrying: usize,
  pub success: usize,
  pub error: usize,
  pub stopped: usize,
  pub cancelled: usize,
  pub workers_total: usize,
  pub workers_busy: usize,
  pub queue_capacity: usize,
  pub queue_depth: usize,
}
