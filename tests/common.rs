//! tests/common.rs
//! Shared helper runners and fakes for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dockhand::error::DeliveryError;
use dockhand::hooks::{HookDelivery, HookPayload};
use dockhand::{
  ControllerBuilder, JobController, JobParameters, JobState, JobStats, JobRunner, RunContext,
  RunError,
};
use tracing_subscriber::fmt::TestWriter;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// Base builder used by most tests: fast hook retries, small dedup TTL not
// needed (markers are released on terminal states anyway).
pub fn base_builder(worker_count: usize) -> ControllerBuilder {
  JobController::builder()
    .worker_count(worker_count)
    .hook_retry(3, Duration::from_millis(20))
}

// Polls `get_job` until the record reaches `want` or the timeout elapses.
pub async fn wait_for_state(
  controller: &JobController,
  id: &str,
  want: JobState,
  timeout: Duration,
) -> JobStats {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    let stats = controller.get_job(id).await.expect("get_job during wait");
    if stats.state == want {
      return stats;
    }
    assert!(
      tokio::time::Instant::now() < deadline,
      "timed out waiting for job {} to reach {:?} (currently {:?})",
      id,
      want,
      stats.state
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
}

// Increments a counter per run, optionally delays, succeeds or fails.
pub struct CountingRunner {
  pub counter: Arc<AtomicUsize>,
  pub delay: Duration,
  pub succeeds: bool,
}

#[async_trait]
impl JobRunner for CountingRunner {
  async fn run(&self, _ctx: RunContext, _params: JobParameters) -> Result<(), RunError> {
    let count = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::debug!(count, succeeds = self.succeeds, "Counting runner executing");
    if self.delay > Duration::ZERO {
      tokio::time::sleep(self.delay).await;
    }
    if self.succeeds {
      Ok(())
    } else {
      Err(RunError::msg("counting runner forced failure"))
    }
  }
}

// Fails the first `fail_first` runs, then succeeds.
pub struct FailNTimesRunner {
  pub fail_first: usize,
  pub attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl JobRunner for FailNTimesRunner {
  async fn run(&self, _ctx: RunContext, _params: JobParameters) -> Result<(), RunError> {
    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt <= self.fail_first {
      tracing::debug!(attempt, "FailNTimes runner failing");
      Err(RunError::msg(format!("transient failure on attempt {attempt}")))
    } else {
      tracing::debug!(attempt, "FailNTimes runner succeeding");
      Ok(())
    }
  }
}

// Fails its first run; later runs block until cancelled. Lets a test park a
// job in Error and then keep its re-run in flight for as long as needed.
pub struct FailThenBlockRunner {
  pub attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl JobRunner for FailThenBlockRunner {
  async fn run(&self, ctx: RunContext, _params: JobParameters) -> Result<(), RunError> {
    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt == 1 {
      tracing::debug!("FailThenBlock runner failing first attempt");
      return Err(RunError::msg("first attempt fails"));
    }
    tracing::debug!(attempt, "FailThenBlock runner blocking");
    tokio::select! {
      _ = ctx.cancelled() => {}
      _ = tokio::time::sleep(Duration::from_secs(10)) => {}
    }
    Ok(())
  }
}

// Succeeds or fails depending on a shared switch, so a test can flip the
// outcome between the original run and a retry.
pub struct SwitchRunner {
  pub ok: Arc<AtomicBool>,
}

#[async_trait]
impl JobRunner for SwitchRunner {
  async fn run(&self, _ctx: RunContext, _params: JobParameters) -> Result<(), RunError> {
    if self.ok.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err(RunError::msg("switch runner failing"))
    }
  }
}

// Runs until cancelled (or a long fallback sleep); records whether the
// cancellation signal was observed.
pub struct BlockUntilCancelledRunner {
  pub observed_cancel: Arc<AtomicBool>,
}

#[async_trait]
impl JobRunner for BlockUntilCancelledRunner {
  async fn run(&self, ctx: RunContext, _params: JobParameters) -> Result<(), RunError> {
    tokio::select! {
      _ = ctx.cancelled() => {
        tracing::debug!("Blocking runner observed cancellation");
        self.observed_cancel.store(true, Ordering::SeqCst);
      }
      _ = tokio::time::sleep(Duration::from_secs(10)) => {
        tracing::debug!("Blocking runner hit fallback sleep");
      }
    }
    Ok(())
  }
}

// Sleeps for a fixed duration, then succeeds.
pub struct SleepRunner {
  pub delay: Duration,
}

#[async_trait]
impl JobRunner for SleepRunner {
  async fn run(&self, _ctx: RunContext, _params: JobParameters) -> Result<(), RunError> {
    tokio::time::sleep(self.delay).await;
    Ok(())
  }
}

// Writes log lines and a check-in message, then succeeds.
pub struct LoggingRunner;

#[async_trait]
impl JobRunner for LoggingRunner {
  async fn run(&self, ctx: RunContext, params: JobParameters) -> Result<(), RunError> {
    let image = params
      .get("image")
      .and_then(|v| v.as_str())
      .unwrap_or("<none>");
    ctx
      .log(&format!("replicating {image}"))
      .await
      .map_err(|e| RunError::msg(e.to_string()))?;
    ctx
      .check_in("halfway")
      .await
      .map_err(|e| RunError::msg(e.to_string()))?;
    ctx
      .log("replication complete")
      .await
      .map_err(|e| RunError::msg(e.to_string()))?;
    Ok(())
  }
}

// Records webhook payloads instead of POSTing them; can fail the first N
// delivery attempts to exercise the retry path.
pub struct RecordingHookDelivery {
  pub deliveries: Mutex<Vec<HookPayload>>,
  pub attempts: AtomicUsize,
  fail_first: usize,
}

impl RecordingHookDelivery {
  pub fn new() -> Self {
    Self::failing_first(0)
  }

  pub fn failing_first(fail_first: usize) -> Self {
    Self {
      deliveries: Mutex::new(Vec::new()),
      attempts: AtomicUsize::new(0),
      fail_first,
    }
  }

  pub fn recorded(&self) -> Vec<HookPayload> {
    self.deliveries.lock().unwrap().clone()
  }
}

#[async_trait]
impl HookDelivery for RecordingHookDelivery {
  async fn deliver(&self, _url: &str, payload: &HookPayload) -> Result<(), DeliveryError> {
    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt <= self.fail_first {
      tracing::debug!(attempt, "Recording delivery failing on purpose");
      return Err(DeliveryError::Status(503));
    }
    self.deliveries.lock().unwrap().push(payload.clone());
    Ok(())
  }
}
