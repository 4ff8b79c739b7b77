//! The `JobController` façade and its builder.
//!
//! The controller wires the deduplicator, status tracker, worker pool,
//! periodic scheduler, and webhook notifier together and exposes the public
//! job operations. All collaborators are injected explicitly at build time;
//! nothing here reaches for process-global state.

use crate::dedup::{scoped_name, Deduplicator, MarkerStore, MemoryMarkerStore};
use crate::error::{BuildError, DedupError, LaunchError, OpError, ShutdownError};
use crate::hooks::{HookDelivery, HttpHookDelivery, WebhookNotifier};
use crate::job::runner::JobRegistry;
use crate::job::{JobId, JobKind, JobRecord, JobRequest, JobState, JobStats, PoolStats};
use crate::periodic::{MisfirePolicy, PeriodicDefinition, PeriodicScheduler, SpawnRequest};
use crate::pool::{self, EnqueueError, WorkerPool};
use crate::state::StatusTracker;
use crate::store::{JobStore, LogSink, MemoryJobStore, MemoryLogSink};

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_HOOK_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_HOOK_BACKOFF_BASE: Duration = Duration::from_millis(500);
const SPAWN_CHANNEL_BOUND: usize = 64;

/// Fluent builder for [`JobController`].
///
/// `worker_count` is mandatory; every collaborator has an in-memory or HTTP
/// default that can be swapped for a durable/test implementation.
pub struct ControllerBuilder {
  worker_count: Option<usize>,
  queue_capacity: usize,
  namespace: String,
  dedup_ttl: Duration,
  misfire_policy: MisfirePolicy,
  hook_max_attempts: u32,
  hook_backoff_base: Duration,
  registry: JobRegistry,
  job_store: Option<Arc<dyn JobStore>>,
  log_sink: Option<Arc<dyn LogSink>>,
  marker_store: Option<Arc<dyn MarkerStore>>,
  hook_delivery: Option<Arc<dyn HookDelivery>>,
}

impl Default for ControllerBuilder {
  fn default() -> Self {
    Self::new()
  }
}

impl ControllerBuilder {
  pub fn new() -> Self {
    Self {
      worker_count: None,
      queue_capacity: DEFAULT_QUEUE_CAPACITY,
      namespace: "default".to_string(),
      dedup_ttl: DEFAULT_DEDUP_TTL,
      misfire_policy: MisfirePolicy::default(),
      hook_max_attempts: DEFAULT_HOOK_MAX_ATTEMPTS,
      hook_backoff_base: DEFAULT_HOOK_BACKOFF_BASE,
      registry: JobRegistry::new(),
      job_store: None,
      log_sink: None,
      marker_store: None,
      hook_delivery: None,
    }
  }

  /// Sets the number of worker tasks (Required).
  pub fn worker_count(mut self, count: usize) -> Self {
    self.worker_count = Some(count);
    self
  }

  /// Sets the dispatch queue bound. Submissions beyond it are rejected with
  /// `QueueFull`. Defaults to 256.
  pub fn queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = capacity;
    self
  }

  /// Namespace mixed into dedup fingerprints, isolating co-located
  /// deployments sharing one marker store. Defaults to `"default"`.
  pub fn namespace(mut self, namespace: &str) -> Self {
    self.namespace = namespace.to_string();
    self
  }

  /// TTL on uniqueness markers; must exceed any plausible job runtime.
  /// Defaults to 24 hours.
  pub fn dedup_ttl(mut self, ttl: Duration) -> Self {
    self.dedup_ttl = ttl;
    self
  }

  /// Policy for cron firings missed while the scheduler was down.
  /// Defaults to [`MisfirePolicy::FireOnce`].
  pub fn misfire_policy(mut self, policy: MisfirePolicy) -> Self {
    self.misfire_policy = policy;
    self
  }

  /// Webhook delivery retry budget and backoff base.
  pub fn hook_retry(mut self, max_attempts: u32, backoff_base: Duration) -> Self {
    self.hook_max_attempts = max_attempts;
    self.hook_backoff_base = backoff_base;
    self
  }

  /// Registers a runner for a job type name. Submissions naming an
  /// unregistered type are rejected at validation.
  pub fn register_runner(
    mut self,
    name: &str,
    runner: Arc<dyn crate::job::runner::JobRunner>,
  ) -> Self {
    self.registry.register(name, runner);
    self
  }

  pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
    self.job_store = Some(store);
    self
  }

  pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
    self.log_sink = Some(sink);
    self
  }

  pub fn marker_store(mut self, store: Arc<dyn MarkerStore>) -> Self {
    self.marker_store = Some(store);
    self
  }

  pub fn hook_delivery(mut self, delivery: Arc<dyn HookDelivery>) -> Self {
    self.hook_delivery = Some(delivery);
    self
  }

  /// Assembles the controller and spawns its background tasks (workers,
  /// periodic ticker, webhook deliverer, submission pump) onto the current
  /// tokio runtime.
  pub fn build(self) -> Result<JobController, BuildError> {
    let worker_count = self.worker_count.ok_or(BuildError::MissingWorkerCount)?;
    if self.queue_capacity == 0 {
      return Err(BuildError::ZeroQueueCapacity);
    }

    let job_store = self
      .job_store
      .unwrap_or_else(|| Arc::new(MemoryJobStore::new()));
    let log_sink = self
      .log_sink
      .unwrap_or_else(|| Arc::new(MemoryLogSink::new()));
    let marker_store = self
      .marker_store
      .unwrap_or_else(|| Arc::new(MemoryMarkerStore::new()));
    let hook_delivery = self
      .hook_delivery
      .unwrap_or_else(|| Arc::new(HttpHookDelivery::new()));
    let registry = Arc::new(self.registry);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dedup = Arc::new(Deduplicator::new(
      &self.namespace,
      self.dedup_ttl,
      marker_store,
    ));
    let (notifier, notifier_handle) = WebhookNotifier::start(
      hook_delivery,
      self.hook_max_attempts,
      self.hook_backoff_base,
      shutdown_rx.clone(),
    );
    let tracker = Arc::new(StatusTracker::new(
      job_store.clone(),
      dedup.clone(),
      notifier,
    ));
    let (pool, worker_handles) = WorkerPool::start(
      worker_count,
      self.queue_capacity,
      tracker.clone(),
      registry.clone(),
      log_sink.clone(),
      shutdown_rx.clone(),
    );

    let (spawn_tx, spawn_rx) = mpsc::channel::<SpawnRequest>(SPAWN_CHANNEL_BOUND);
    let (scheduler, scheduler_handle) =
      PeriodicScheduler::start(self.misfire_policy, spawn_tx, shutdown_rx.clone());

    let controller = JobController {
      inner: Arc::new(ControllerInner {
        registry,
        store: job_store,
        log_sink,
        dedup,
        tracker,
        pool,
        scheduler,
        shutdown_tx,
        shutting_down: AtomicBool::new(false),
        handles: parking_lot::Mutex::new(Vec::new()),
      }),
    };

    let pump_handle = controller.spawn_submission_pump(spawn_rx, shutdown_rx);

    {
      let mut handles = controller.inner.handles.lock();
      handles.extend(worker_handles);
      handles.push(scheduler_handle);
      handles.push(notifier_handle);
      handles.push(pump_handle);
    }

    info!(
      worker_count,
      queue_capacity = self.queue_capacity,
      namespace = %self.namespace,
      "Job controller assembled."
    );
    Ok(controller)
  }
}

struct ControllerInner {
  registry: Arc<JobRegistry>,
  store: Arc<dyn JobStore>,
  log_sink: Arc<dyn LogSink>,
  dedup: Arc<Deduplicator>,
  tracker: Arc<StatusTracker>,
  pool: WorkerPool,
  scheduler: PeriodicScheduler,
  shutdown_tx: watch::Sender<bool>,
  shutting_down: AtomicBool,
  handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// The public façade over the job orchestration core. Cheap to clone.
#[derive(Clone)]
pub struct JobController {
  inner: Arc<ControllerInner>,
}

impl JobController {
  pub fn builder() -> ControllerBuilder {
    ControllerBuilder::new()
  }

  /// Reconciles records left `Running`/`Retrying` by a previous process
  /// generation, forcing them to `Error`. Call once after `build()`, before
  /// accepting submissions, when using a durable store.
  pub async fn reconcile(&self) -> Result<usize, OpError> {
    pool::reconcile_orphans(&self.inner.store, &self.inner.tracker).await
  }

  /// Submits a job. Validates the request, enforces the dedup invariant,
  /// persists a `Pending` record, and either enqueues it (one-off) or
  /// registers the standing definition (periodic).
  ///
  /// Once `Ok` is returned the job's further fate is reported through the
  /// record and its status hook, never as an error from this method.
  pub async fn launch_job(&self, request: JobRequest) -> Result<JobStats, LaunchError> {
    if self.inner.shutting_down.load(AtomicOrdering::SeqCst) {
      return Err(LaunchError::Shutdown);
    }

    if request.name.trim().is_empty() {
      return Err(LaunchError::Validation("job name must not be empty".into()));
    }
    if !self.inner.registry.contains(&request.name) {
      return Err(LaunchError::Validation(format!(
        "no runner registered for job type '{}'",
        request.name
      )));
    }

    match request.kind() {
      JobKind::Periodic => self.launch_periodic(request).await,
      JobKind::Generic | JobKind::ScheduledInstance => self.launch_oneoff(request, None).await,
    }
  }

  async fn launch_oneoff(
    &self,
    request: JobRequest,
    upstream_id: Option<JobId>,
  ) -> Result<JobStats, LaunchError> {
    let marker_name = scoped_name(&request.name, request.kind());
    let fingerprint = match self
      .inner
      .dedup
      .acquire(&marker_name, &request.parameters)
      .await
    {
      Ok(fp) => fp,
      Err(DedupError::Duplicate(fingerprint)) => {
        return Err(LaunchError::Duplicate {
          name: request.name,
          fingerprint,
        });
      }
      Err(DedupError::Store(e)) => return Err(e.into()),
    };

    let mut record = JobRecord::from_request(&request);
    record.upstream_id = upstream_id;
    if let Err(e) = self.inner.tracker.create_pending(&record).await {
      // Record never existed; hand the marker back directly.
      if let Err(rel) = self
        .inner
        .dedup
        .release(&marker_name, &request.parameters)
        .await
      {
        warn!(error = %rel, "Failed to release marker after store failure.");
      }
      return Err(e.into());
    }
    debug!(job_id = %record.id, %fingerprint, "Accepted submission.");

    match self.inner.pool.try_enqueue(record.id.clone()) {
      Ok(()) => Ok(JobStats::from(&record)),
      Err(enqueue_err) => {
        // Park the record; the terminal transition releases the marker.
        let parked = self
          .inner
          .tracker
          .transition_with(&record.id, JobState::Error, |r| {
            r.error = Some("enqueue rejected: worker pool queue full".to_string());
          })
          .await;
        if let Err(e) = parked {
          error!(job_id = %record.id, error = %e, "Failed to park rejected submission.");
        }
        match enqueue_err {
          EnqueueError::QueueFull => Err(LaunchError::QueueFull),
          EnqueueError::Closed => Err(LaunchError::Shutdown),
        }
      }
    }
  }

  async fn launch_periodic(&self, request: JobRequest) -> Result<JobStats, LaunchError> {
    // Parse before creating any state so a bad expression leaves no trace.
    PeriodicDefinition::new(String::new(), request.clone())?;

    let marker_name = scoped_name(&request.name, JobKind::Periodic);
    let fingerprint = match self
      .inner
      .dedup
      .acquire(&marker_name, &request.parameters)
      .await
    {
      Ok(fp) => fp,
      Err(DedupError::Duplicate(fingerprint)) => {
        return Err(LaunchError::Duplicate {
          name: request.name,
          fingerprint,
        });
      }
      Err(DedupError::Store(e)) => return Err(e.into()),
    };

    let record = JobRecord::from_request(&request);
    if let Err(e) = self.inner.tracker.create_pending(&record).await {
      if let Err(rel) = self
        .inner
        .dedup
        .release(&marker_name, &request.parameters)
        .await
      {
        warn!(error = %rel, "Failed to release marker after store failure.");
      }
      return Err(e.into());
    }

    let definition = PeriodicDefinition::new(record.id.clone(), request)?;
    if let Err(e) = self.inner.scheduler.register(definition).await {
      let parked = self
        .inner
        .tracker
        .transition_with(&record.id, JobState::Error, |r| {
          r.error = Some("periodic scheduler unavailable".to_string());
        })
        .await;
      if let Err(park_err) = parked {
        error!(job_id = %record.id, error = %park_err, "Failed to park periodic definition.");
      }
      return Err(e);
    }

    info!(
      job_id = %record.id,
      job_name = %record.name,
      %fingerprint,
      "Registered periodic job definition."
    );
    Ok(JobStats::from(&record))
  }

  /// Returns the current public snapshot of a job record.
  pub async fn get_job(&self, id: &str) -> Result<JobStats, OpError> {
    validate_job_id(id)?;
    let record = self.inner.tracker.get(&id.to_string()).await?;
    Ok(JobStats::from(&record))
  }

  /// Requests a stop. Pending jobs go straight to `Stopped`; running jobs
  /// are committed `Stopped` and their execution context receives a
  /// cooperative cancellation signal. Stopping a periodic definition
  /// unregisters it; already-spawned instances are unaffected.
  pub async fn stop_job(&self, id: &str) -> Result<(), OpError> {
    validate_job_id(id)?;
    let id = id.to_string();
    let record = self.inner.tracker.get(&id).await?;

    if record.kind == JobKind::Periodic {
      let removed = self.inner.scheduler.unregister(&id).await?;
      debug!(job_id = %id, removed, "Unregistered periodic definition for stop.");
    }

    self.inner.tracker.transition(&id, JobState::Stopped).await?;
    self.inner.pool.signal_cancel(&id);
    info!(job_id = %id, "Job stopped.");
    Ok(())
  }

  /// Cancels a job that has not started running. Once execution begins the
  /// only way out is `stop_job`. Cancelling a periodic definition unregisters
  /// it; already-spawned instances are unaffected.
  pub async fn cancel_job(&self, id: &str) -> Result<(), OpError> {
    validate_job_id(id)?;
    let id = id.to_string();
    let record = self.inner.tracker.get(&id).await?;

    if record.kind == JobKind::Periodic {
      let removed = self.inner.scheduler.unregister(&id).await?;
      debug!(job_id = %id, removed, "Unregistered periodic definition for cancel.");
    }

    self
      .inner
      .tracker
      .transition(&id, JobState::Cancelled)
      .await?;
    info!(job_id = %id, "Job cancelled before execution.");
    Ok(())
  }

  /// Re-runs a job that ended in `Error`: the record re-enters `Pending`
  /// with a fresh retry budget and is enqueued again under the same ID.
  pub async fn retry_job(&self, id: &str) -> Result<(), OpError> {
    validate_job_id(id)?;
    let id = id.to_string();
    let record = self.inner.tracker.get(&id).await?;
    if record.state != JobState::Error {
      return Err(OpError::InvalidTransition {
        id,
        from: record.state,
        to: JobState::Pending,
      });
    }

    // The marker was released when the record went terminal. Re-claim it so
    // the dedup invariant holds for the re-run; a concurrent identical
    // submission may already hold it, in which case this job simply shares
    // the in-flight slot.
    let marker_name = scoped_name(&record.name, record.kind);
    match self
      .inner
      .dedup
      .acquire(&marker_name, &record.parameters)
      .await
    {
      Ok(_) | Err(DedupError::Duplicate(_)) => {}
      Err(DedupError::Store(e)) => return Err(e.into()),
    }

    // No marker release on failure: the transition only fails if a racing
    // operation already moved the record out of `Error`, so the marker is
    // either guarding that in-flight re-run or was cleaned up by its
    // terminal housekeeping. Deleting it here would free a slot that a
    // non-terminal job still holds.
    self
      .inner
      .tracker
      .transition_with(&id, JobState::Pending, |r| {
        r.retry_count = 0;
        r.error = None;
        r.check_in = None;
        r.enqueue_time = Some(chrono::Utc::now());
      })
      .await?;

    match self.inner.pool.try_enqueue(id.clone()) {
      Ok(()) => {
        info!(job_id = %id, "Job re-enqueued for retry.");
        Ok(())
      }
      Err(_) => {
        let parked = self
          .inner
          .tracker
          .transition_with(&id, JobState::Error, |r| {
            r.error = Some("retry enqueue rejected: worker pool queue full".to_string());
          })
          .await;
        if let Err(e) = parked {
          error!(job_id = %id, error = %e, "Failed to park rejected retry.");
        }
        Err(OpError::QueueFull)
      }
    }
  }

  /// Dispatches a wire-level action name onto the matching operation, so a
  /// boundary adapter can forward opaque action strings.
  pub async fn job_action(&self, id: &str, action: &str) -> Result<(), OpError> {
    match crate::job::JobAction::parse(action) {
      Some(crate::job::JobAction::Stop) => self.stop_job(id).await,
      Some(crate::job::JobAction::Cancel) => self.cancel_job(id).await,
      Some(crate::job::JobAction::Retry) => self.retry_job(id).await,
      None => Err(OpError::UnsupportedAction(action.to_string())),
    }
  }

  /// Aggregate liveness/health snapshot: per-state record counts plus worker
  /// and queue occupancy.
  pub async fn check_status(&self) -> Result<PoolStats, OpError> {
    let records = self.inner.store.list().await?;
    let mut stats = PoolStats {
      workers_total: self.inner.pool.worker_count(),
      workers_busy: self.inner.pool.busy_workers(),
      queue_capacity: self.inner.pool.queue_capacity(),
      queue_depth: self.inner.pool.queue_depth(),
      ..PoolStats::default()
    };
    for record in &records {
      match record.state {
        JobState::Pending => stats.pending += 1,
        JobState::Running => stats.running += 1,
        JobState::Retrying => stats.retrying += 1,
        JobState::Success => stats.success += 1,
        JobState::Error => stats.error += 1,
        JobState::Stopped => stats.stopped += 1,
        JobState::Cancelled => stats.cancelled += 1,
      }
    }
    Ok(stats)
  }

  /// Returns the captured log for a job. The identifier is validated as an
  /// opaque token before it gets anywhere near the sink, so a path-shaped
  /// "ID" can never address sink internals.
  pub async fn get_job_log_data(&self, id: &str) -> Result<Vec<u8>, OpError> {
    validate_job_id(id)?;
    self
      .inner
      .log_sink
      .read(id)
      .await?
      .ok_or_else(|| OpError::NotFound(id.to_string()))
  }

  /// Signals shutdown and waits for background tasks to finish. Intake stops
  /// immediately; in-flight executions run to completion within the timeout.
  pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!("Initiating graceful shutdown...");
    self.inner.shutting_down.store(true, AtomicOrdering::SeqCst);
    self.inner.pool.close();
    self
      .inner
      .shutdown_tx
      .send(true)
      .map_err(|_| ShutdownError::SignalFailed)?;

    let handles: Vec<JoinHandle<()>> = self.inner.handles.lock().drain(..).collect();
    let join_all = futures::future::join_all(handles);
    let results = match timeout {
      Some(t) => tokio::time::timeout(t, join_all)
        .await
        .map_err(|_| ShutdownError::Timeout)?,
      None => join_all.await,
    };
    for result in results {
      if let Err(e) = result {
        if e.is_panic() {
          error!("Background task panicked during shutdown.");
          return Err(ShutdownError::TaskPanic);
        }
      }
    }
    info!("Shutdown complete.");
    Ok(())
  }

  fn spawn_submission_pump(
    &self,
    mut spawn_rx: mpsc::Receiver<SpawnRequest>,
    mut shutdown_rx: watch::Receiver<bool>,
  ) -> JoinHandle<()> {
    let controller = self.clone();
    tokio::spawn(async move {
      info!("Submission pump started.");
      loop {
        tokio::select! {
          biased;

          Ok(()) = shutdown_rx.changed() => {
            if *shutdown_rx.borrow() {
              info!("Submission pump received shutdown signal.");
              break;
            }
          }

          maybe_spawn = spawn_rx.recv() => {
            let Some(spawn) = maybe_spawn else {
              info!("Spawn channel closed, submission pump exiting.");
              break;
            };
            controller.spawn_instance(spawn).await;
          }
        }
      }
      info!("Submission pump task shutting down.");
    })
  }

  /// Turns one periodic firing into a `ScheduledInstance` submission through
  /// the normal dedup + queue path.
  async fn spawn_instance(&self, spawn: SpawnRequest) {
    let mut request = spawn.request;
    request.metadata.kind = Some(JobKind::ScheduledInstance);
    request.metadata.cron = None;
    let job_name = request.name.clone();

    match self
      .launch_oneoff(request, Some(spawn.definition_id.clone()))
      .await
    {
      Ok(stats) => {
        debug!(
          definition_id = %spawn.definition_id,
          job_id = %stats.id,
          job_name = %job_name,
          "Spawned scheduled instance."
        );
      }
      Err(LaunchError::Duplicate { .. }) => {
        // Previous instance still in flight; this firing is absorbed.
        debug!(
          definition_id = %spawn.definition_id,
          job_name = %job_name,
          "Skipped firing: previous instance still in flight."
        );
      }
      Err(e) => {
        warn!(
          definition_id = %spawn.definition_id,
          job_name = %job_name,
          error = %e,
          "Failed to spawn scheduled instance."
        );
      }
    }
  }
}

impl std::fmt::Debug for JobController {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("JobController").finish_non_exhaustive()
  }
}

/// Job identifiers are opaque tokens. Anything path-shaped is rejected
/// before reaching a storage collaborator.
fn validate_job_id(id: &str) -> Result<(), OpError> {
  if id.is_empty() || id.contains("..") || id.contains('/') || id.contains('\\') {
    return Err(OpError::InvalidId(id.to_string()));
  }
  Ok(())
}
