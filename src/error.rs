use crate::job::{JobId, JobState};

use thiserror::Error;

/// Errors that can occur while assembling a `JobController` via `ControllerBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Worker count (`worker_count`) must be specified")]
  MissingWorkerCount,
  #[error("Queue capacity must be greater than zero")]
  ZeroQueueCapacity,
}

/// Errors reported by the Job Record Store, Log Sink, or dedup marker backend.
///
/// Store failures are treated as fatal for the triggering operation: callers
/// fail closed rather than proceeding on guessed state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  #[error("store backend unavailable: {0}")]
  Unavailable(String),
  #[error("store backend error: {0}")]
  Backend(String),
}

/// Errors surfaced synchronously to the submitter by `launch_job`.
///
/// All of these occur before (or while rolling back) record creation; once a
/// job is accepted, execution failures are captured into the record itself and
/// never thrown back across the async boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
  /// The request shape is malformed (missing name, unregistered job type,
  /// unparseable cron expression, ...). Rejected before any state is created.
  #[error("invalid job request: {0}")]
  Validation(String),
  /// An identical submission (same name + parameters) is still in flight.
  #[error("duplicate submission of job '{name}' (fingerprint {fingerprint})")]
  Duplicate { name: String, fingerprint: String },
  /// The worker pool backlog exceeds its configured bound. Backpressure
  /// signal; the record is parked in `Error` state, nothing is silently lost.
  #[error("worker pool queue is full, submission rejected")]
  QueueFull,
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error("controller is shutting down")]
  Shutdown,
}

/// Errors for operations addressing an existing job
/// (`get_job`, `stop_job`, `cancel_job`, `retry_job`, `get_job_log_data`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
  #[error("job {0} not found")]
  NotFound(JobId),
  /// The requested action is not legal for the job's current state.
  /// The record is left untouched.
  #[error("job {id}: transition {from:?} -> {to:?} is not allowed")]
  InvalidTransition {
    id: JobId,
    from: JobState,
    to: JobState,
  },
  /// The job identifier failed opaque-token validation (path-like characters).
  #[error("invalid job id: {0}")]
  InvalidId(String),
  /// Action name not recognized; the boundary adapter maps this to
  /// not-implemented.
  #[error("unsupported job action '{0}'")]
  UnsupportedAction(String),
  #[error("worker pool queue is full")]
  QueueFull,
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Errors raised by the dedup marker check.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DedupError {
  #[error("uniqueness marker already held (fingerprint {0})")]
  Duplicate(String),
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Webhook delivery failures. Logged only; never propagated to the caller of
/// a job operation and never rolls back a committed state transition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
  #[error("hook endpoint returned status {0}")]
  Status(u16),
  #[error("hook transport error: {0}")]
  Transport(String),
}

/// Errors related to the controller shutdown process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (controller already shut down).")]
  SignalFailed,
  #[error("Timed out waiting for background tasks to complete shutdown.")]
  Timeout,
  #[error("A background task panicked during the shutdown process.")]
  TaskPanic,
}
