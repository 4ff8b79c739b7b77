//! tests/lifecycle.rs
//! Stop, cancel, retry, and the monotonic state machine.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{
  base_builder, setup_tracing, wait_for_state, BlockUntilCancelledRunner, CountingRunner,
  SwitchRunner,
};
use dockhand::{JobRequest, JobState, OpError};

#[tokio::test]
async fn stop_while_pending_prevents_execution() {
  setup_tracing();
  let counter = Arc::new(AtomicUsize::new(0));
  let blocked = Arc::new(AtomicBool::new(false));
  // One worker, occupied by a blocker, so the target job stays queued.
  let controller = base_builder(1)
    .register_runner(
      "blocker",
      Arc::new(BlockUntilCancelledRunner {
        observed_cancel: blocked.clone(),
      }),
    )
    .register_runner(
      "gc",
      Arc::new(CountingRunner {
        counter: counter.clone(),
        delay: Duration::ZERO,
        succeeds: true,
      }),
    )
    .build()
    .unwrap();

  let blocker = controller.launch_job(JobRequest::generic("blocker")).await.unwrap();
  wait_for_state(&controller, &blocker.id, JobState::Running, Duration::from_secs(3)).await;

  let target = controller.launch_job(JobRequest::generic("gc")).await.unwrap();
  controller.stop_job(&target.id).await.unwrap();
  let stopped = controller.get_job(&target.id).await.unwrap();
  assert_eq!(stopped.state, JobState::Stopped);

  // Free the worker; the stopped job must be skipped, not executed.
  controller.stop_job(&blocker.id).await.unwrap();
  tokio::time::sleep(Duration::from_millis(300)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 0, "stopped job must never run");
  assert!(blocked.load(Ordering::SeqCst), "blocker must observe its cancellation");

  controller.shutdown(Some(Duration::from_secs(2))).await.unwrap();
}

#[tokio::test]
async fn stop_running_job_signals_cancellation() {
  setup_tracing();
  let observed = Arc::new(AtomicBool::new(false));
  let controller = base_builder(1)
    .register_runner(
      "scan",
      Arc::new(BlockUntilCancelledRunner {
        observed_cancel: observed.clone(),
      }),
    )
    .build()
    .unwrap();

  let job = controller.launch_job(JobRequest::generic("scan")).await.unwrap();
  wait_for_state(&controller, &job.id, JobState::Running, Duration::from_secs(3)).await;

  controller.stop_job(&job.id).await.unwrap();
  let stopped = controller.get_job(&job.id).await.unwrap();
  assert_eq!(stopped.state, JobState::Stopped, "state reflects the request immediately");

  // The runner's Ok(()) after the stop must not overwrite the terminal state.
  tokio::time::sleep(Duration::from_millis(300)).await;
  assert!(observed.load(Ordering::SeqCst));
  let still = controller.get_job(&job.id).await.unwrap();
  assert_eq!(still.state, JobState::Stopped);
  assert_eq!(still.revision, stopped.revision, "no transition after terminal");

  controller.shutdown(Some(Duration::from_secs(2))).await.unwrap();
}

#[tokio::test]
async fn cancel_applies_only_before_execution() {
  setup_tracing();
  let observed = Arc::new(AtomicBool::new(false));
  let controller = base_builder(1)
    .register_runner(
      "blocker",
      Arc::new(BlockUntilCancelledRunner {
        observed_cancel: observed.clone(),
      }),
    )
    .build()
    .unwrap();

  // Occupy the worker, queue a second job, cancel it while pending.
  let running = controller.launch_job(JobRequest::generic("blocker")).await.unwrap();
  wait_for_state(&controller, &running.id, JobState::Running, Duration::from_secs(3)).await;
  let queued = controller
    .launch_job(JobRequest::generic("blocker").with_param("n", 2))
    .await
    .unwrap();

  controller.cancel_job(&queued.id).await.unwrap();
  assert_eq!(
    controller.get_job(&queued.id).await.unwrap().state,
    JobState::Cancelled
  );

  // A running job cannot be cancelled, only stopped.
  let err = controller.cancel_job(&running.id).await.unwrap_err();
  assert!(matches!(err, OpError::InvalidTransition { .. }));

  controller.stop_job(&running.id).await.unwrap();
  controller.shutdown(Some(Duration::from_secs(2))).await.unwrap();
}

#[tokio::test]
async fn retry_reruns_only_error_jobs() {
  setup_tracing();
  let ok = Arc::new(AtomicBool::new(false));
  let controller = base_builder(1)
    .register_runner("flaky", Arc::new(SwitchRunner { ok: ok.clone() }))
    .build()
    .unwrap();

  let job = controller.launch_job(JobRequest::generic("flaky")).await.unwrap();
  let failed = wait_for_state(&controller, &job.id, JobState::Error, Duration::from_secs(3)).await;
  assert!(failed.error.is_some());

  // Flip the switch and retry under the same ID.
  ok.store(true, Ordering::SeqCst);
  controller.retry_job(&job.id).await.unwrap();
  let done = wait_for_state(&controller, &job.id, JobState::Success, Duration::from_secs(3)).await;
  assert_eq!(done.id, job.id);
  assert!(done.revision > failed.revision, "retry continues the revision line");
  assert_eq!(done.retry_count, 0, "retry starts a fresh budget");
  assert!(done.error.is_none());

  // Success is terminal; retrying it is rejected without touching the record.
  let err = controller.retry_job(&job.id).await.unwrap_err();
  assert!(matches!(err, OpError::InvalidTransition { .. }));
  let after = controller.get_job(&job.id).await.unwrap();
  assert_eq!(after.revision, done.revision);

  controller.shutdown(Some(Duration::from_secs(2))).await.unwrap();
}

#[tokio::test]
async fn unsupported_action_names_are_rejected() {
  setup_tracing();
  let ok = Arc::new(AtomicBool::new(true));
  let controller = base_builder(1)
    .register_runner("flaky", Arc::new(SwitchRunner { ok }))
    .build()
    .unwrap();

  let job = controller.launch_job(JobRequest::generic("flaky")).await.unwrap();
  wait_for_state(&controller, &job.id, JobState::Success, Duration::from_secs(3)).await;

  let err = controller.job_action(&job.id, "pause").await.unwrap_err();
  assert!(matches!(err, OpError::UnsupportedAction(_)));

  controller.shutdown(Some(Duration::from_secs(2))).await.unwrap();
}
