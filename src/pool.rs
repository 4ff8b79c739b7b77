//! Bounded worker pool.
//!
//! A fixed set of worker tasks pulls ready job IDs from a bounded MPMC queue
//! (FIFO, no reordering), drives each record through `Running` to its
//! terminal state, and applies the retry policy. Stop/cancel requests reach
//! an in-flight run as a cooperative cancellation token, never a forced kill:
//! the recorded control-state reflects the request immediately even if the
//! job implementation ignores the signal.

use crate::error::OpError;
use crate::job::runner::{JobRegistry, RunContext};
use crate::job::{JobId, JobState};
use crate::state::StatusTracker;
use crate::store::{JobStore, LogSink};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Enqueue failures, mapped by the controller onto the public error taxonomy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum EnqueueError {
  #[error("worker pool queue is full")]
  QueueFull,
  #[error("worker pool is shut down")]
  Closed,
}

/// Handle owned by the controller; cheap to clone into background tasks.
#[derive(Clone)]
pub(crate) struct WorkerPool {
  dispatch_tx: async_channel::Sender<JobId>,
  worker_count: usize,
  queue_capacity: usize,
  busy_workers: Arc<AtomicUsize>,
  cancel_tokens: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
}

impl WorkerPool {
  /// Spawns `worker_count` worker tasks sharing one bounded dispatch queue.
  /// Returns the pool handle plus the task handles for shutdown joining.
  pub(crate) fn start(
    worker_count: usize,
    queue_capacity: usize,
    tracker: Arc<StatusTracker>,
    registry: Arc<JobRegistry>,
    log_sink: Arc<dyn LogSink>,
    shutdown_rx: watch::Receiver<bool>,
  ) -> (Self, Vec<JoinHandle<()>>) {
    let (dispatch_tx, dispatch_rx) = async_channel::bounded::<JobId>(queue_capacity);
    let busy_workers = Arc::new(AtomicUsize::new(0));
    let cancel_tokens: Arc<Mutex<HashMap<JobId, CancellationToken>>> =
      Arc::new(Mutex::new(HashMap::new()));

    let mut handles = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
      let mut worker = Worker {
        id: worker_id,
        tracker: tracker.clone(),
        registry: registry.clone(),
        log_sink: log_sink.clone(),
        dispatch_rx: dispatch_rx.clone(),
        dispatch_tx: dispatch_tx.clone(),
        shutdown_rx: shutdown_rx.clone(),
        busy_workers: busy_workers.clone(),
        cancel_tokens: cancel_tokens.clone(),
      };
      handles.push(tokio::spawn(async move {
        worker.run().await;
      }));
    }

    (
      Self {
        dispatch_tx,
        worker_count,
        queue_capacity,
        busy_workers,
        cancel_tokens,
      },
      handles,
    )
  }

  /// Non-blocking enqueue; `QueueFull` is the backpressure signal to the
  /// caller, never a silent drop.
  pub(crate) fn try_enqueue(&self, id: JobId) -> Result<(), EnqueueError> {
    match self.dispatch_tx.try_send(id) {
      Ok(()) => Ok(()),
      Err(async_channel::TrySendError::Full(_)) => Err(EnqueueError::QueueFull),
      Err(async_channel::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
    }
  }

  /// Delivers a stop/cancel signal to the in-flight execution context of the
  /// given job, if any. Cooperative: the effect is bounded by the job
  /// implementation's polling interval.
  pub(crate) fn signal_cancel(&self, id: &JobId) {
    let token = self.cancel_tokens.lock().get(id).cloned();
    if let Some(token) = token {
      debug!(job_id = %id, "Delivering cancellation signal to in-flight run.");
      token.cancel();
    }
  }

  /// Stops intake; queued-but-undequeued IDs are dropped with the channel.
  pub(crate) fn close(&self) {
    self.dispatch_tx.close();
  }

  pub(crate) fn worker_count(&self) -> usize {
    self.worker_count
  }

  pub(crate) fn queue_capacity(&self) -> usize {
    self.queue_capacity
  }

  pub(crate) fn queue_depth(&self) -> usize {
    self.dispatch_tx.len()
  }

  pub(crate) fn busy_workers(&self) -> usize {
    self.busy_workers.load(AtomicOrdering::Relaxed)
  }
}

/// Restart reconciliation: jobs left in `Running`/`Retrying` by a previous
/// process generation are non-resumable (their execution context was
/// in-memory only) and must be parked before new submissions proceed.
pub(crate) async fn reconcile_orphans(
  store: &Arc<dyn JobStore>,
  tracker: &Arc<StatusTracker>,
) -> Result<usize, OpError> {
  let records = store.list().await?;
  let mut reconciled = 0;
  for record in records {
    if matches!(record.state, JobState::Running | JobState::Retrying) {
      tracker.mark_orphaned(&record.id).await?;
      reconciled += 1;
    }
  }
  if reconciled > 0 {
    warn!(count = reconciled, "Reconciled orphaned records from a previous generation.");
  }
  Ok(reconciled)
}

struct Worker {
  id: usize,
  tracker: Arc<StatusTracker>,
  registry: Arc<JobRegistry>,
  log_sink: Arc<dyn LogSink>,
  dispatch_rx: async_channel::Receiver<JobId>,
  dispatch_tx: async_channel::Sender<JobId>,
  shutdown_rx: watch::Receiver<bool>,
  busy_workers: Arc<AtomicUsize>,
  cancel_tokens: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
}

impl Worker {
  async fn run(&mut self) {
    info!(worker_id = self.id, "Worker started. Waiting for jobs...");

    loop {
      tokio::select! {
        biased;

        Ok(()) = self.shutdown_rx.changed() => {
          if *self.shutdown_rx.borrow() {
            info!(worker_id = self.id, "Worker received shutdown signal.");
            break;
          }
        }

        result = self.dispatch_rx.recv() => {
          match result {
            Ok(job_id) => {
              let span = tracing::span!(
                tracing::Level::INFO,
                "job_exec",
                worker_id = self.id,
                %job_id,
              );
              self.process(job_id.clone()).instrument(span).await;
            }
            Err(_) => {
              if !*self.shutdown_rx.borrow() {
                error!(worker_id = self.id, "Dispatch channel closed unexpectedly. Worker exiting.");
              } else {
                info!(worker_id = self.id, "Dispatch channel closed during shutdown. Worker exiting.");
              }
              break;
            }
          }
        }
      }
    }

    info!(worker_id = self.id, "Worker task shutting down.");
  }

  async fn process(&self, job_id: JobId) {
    let record = match self.tracker.get(&job_id).await {
      Ok(record) => record,
      Err(OpError::NotFound(_)) => {
        warn!("Dispatched job has no record; discarding.");
        return;
      }
      Err(e) => {
        error!(error = %e, "Failed to fetch dispatched job record.");
        return;
      }
    };

    // A stop/cancel may have landed while the ID sat in the queue.
    if record.state != JobState::Pending {
      debug!(state = ?record.state, "Skipping dequeued job no longer pending.");
      return;
    }

    let record = match self.tracker.transition(&job_id, JobState::Running).await {
      Ok(record) => record,
      Err(OpError::InvalidTransition { from, .. }) => {
        debug!(?from, "Job state moved before pickup; skipping.");
        return;
      }
      Err(e) => {
        error!(error = %e, "Failed to transition job to Running.");
        return;
      }
    };

    let Some(runner) = self.registry.get(&record.name) else {
      // Validation checks the registry at submission, so this only happens
      // if the registry and store disagree across a restart.
      error!(job_name = %record.name, "No runner registered for dispatched job.");
      let _ = self
        .tracker
        .transition_with(&job_id, JobState::Error, |r| {
          r.error = Some(format!("no runner registered for job type '{}'", r.name));
        })
        .await;
      return;
    };

    let token = CancellationToken::new();
    self.cancel_tokens.lock().insert(job_id.clone(), token.clone());
    self.busy_workers.fetch_add(1, AtomicOrdering::Relaxed);

    let ctx = RunContext::new(
      job_id.clone(),
      token,
      self.tracker.clone(),
      self.log_sink.clone(),
    );
    info!(job_name = %record.name, "Starting job execution.");
    let started = Instant::now();
    let result = runner.run(ctx, record.parameters.clone()).await;
    let duration = started.elapsed();

    self.cancel_tokens.lock().remove(&job_id);
    self.busy_workers.fetch_sub(1, AtomicOrdering::Relaxed);

    info!(
      duration_ms = duration.as_millis(),
      outcome = if result.is_ok() { "Success" } else { "Fail" },
      "Finished job execution."
    );

    self.settle(&job_id, &record.name, record.retry_count, record.max_retries, result).await;
  }

  /// Applies the terminal (or retry) transition for a finished run. Errors
  /// from the job implementation are captured into the record, never
  /// propagated past the worker boundary.
  async fn settle(
    &self,
    job_id: &JobId,
    job_name: &str,
    retry_count: u32,
    max_retries: u32,
    result: Result<(), crate::job::runner::RunError>,
  ) {
    // Re-read: a stop request may have committed a terminal state while the
    // run was finishing. The request's intent wins; the observed completion
    // is only logged.
    match self.tracker.get(job_id).await {
      Ok(current) if current.state.is_terminal() => {
        debug!(state = ?current.state, "Record already terminal; run result discarded.");
        return;
      }
      Ok(_) => {}
      Err(e) => {
        error!(error = %e, "Failed to re-read record after execution.");
        return;
      }
    }

    match result {
      Ok(()) => {
        if let Err(e) = self.tracker.transition(job_id, JobState::Success).await {
          debug!(error = %e, "Could not commit Success (state moved underneath).");
        }
      }
      Err(run_err) => {
        if retry_count < max_retries {
          self.schedule_retry(job_id, job_name, run_err.0).await;
        } else {
          warn!(
            job_name,
            retries = retry_count,
            error = %run_err,
            "Job failed permanently after exhausting retries."
          );
          if let Err(e) = self
            .tracker
            .transition_with(job_id, JobState::Error, |r| {
              r.error = Some(run_err.0.clone());
            })
            .await
          {
            debug!(error = %e, "Could not commit Error (state moved underneath).");
          }
        }
      }
    }
  }

  /// Running -> Retrying -> Pending, then back onto the queue.
  async fn schedule_retry(&self, job_id: &JobId, job_name: &str, error_text: String) {
    let retrying = self
      .tracker
      .transition_with(job_id, JobState::Retrying, |r| {
        r.retry_count += 1;
        r.error = Some(error_text);
      })
      .await;
    let record = match retrying {
      Ok(record) => record,
      Err(e) => {
        debug!(error = %e, "Could not enter Retrying (state moved underneath).");
        return;
      }
    };
    info!(
      job_name,
      retry_attempt = record.retry_count,
      max_retries = record.max_retries,
      "Job failed, scheduling retry."
    );

    if let Err(e) = self
      .tracker
      .transition_with(job_id, JobState::Pending, |r| {
        r.error = None;
      })
      .await
    {
      debug!(error = %e, "Could not re-enter Pending for retry.");
      return;
    }

    match self.dispatch_tx.try_send(job_id.clone()) {
      Ok(()) => {}
      Err(async_channel::TrySendError::Full(_)) => {
        warn!(job_name, "Retry re-enqueue rejected: queue full.");
        let _ = self
          .tracker
          .transition_with(job_id, JobState::Error, |r| {
            r.error = Some("retry re-enqueue failed: worker pool queue full".to_string());
          })
          .await;
      }
      Err(async_channel::TrySendError::Closed(_)) => {
        // Shutting down; the Pending record is picked up by restart
        // reconciliation policy (still Pending, re-runnable).
        warn!(job_name, "Retry re-enqueue skipped: pool shut down.");
      }
    }
  }
}
