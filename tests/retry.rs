//! tests/retry.rs
//! Automatic retry policy on failed executions.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{base_builder, setup_tracing, wait_for_state, CountingRunner, FailNTimesRunner};
use dockhand::{JobRequest, JobState};

#[tokio::test]
async fn transient_failures_are_retried_within_budget() {
  setup_tracing();
  let attempts = Arc::new(AtomicUsize::new(0));
  let controller = base_builder(1)
    .register_runner(
      "replicate_image",
      Arc::new(FailNTimesRunner {
        fail_first: 2,
        attempts: attempts.clone(),
      }),
    )
    .build()
    .unwrap();

  let job = controller
    .launch_job(JobRequest::generic("replicate_image").with_max_retries(3))
    .await
    .unwrap();

  let done = wait_for_state(&controller, &job.id, JobState::Success, Duration::from_secs(5)).await;
  assert_eq!(attempts.load(Ordering::SeqCst), 3, "two failures plus the success");
  assert_eq!(done.retry_count, 2);
  assert!(done.error.is_none(), "error text is cleared on re-enqueue");

  controller.shutdown(Some(Duration::from_secs(2))).await.unwrap();
}

#[tokio::test]
async fn exhausted_budget_ends_in_error_with_text() {
  setup_tracing();
  let counter = Arc::new(AtomicUsize::new(0));
  let controller = base_builder(1)
    .register_runner(
      "gc",
      Arc::new(CountingRunner {
        counter: counter.clone(),
        delay: Duration::ZERO,
        succeeds: false,
      }),
    )
    .build()
    .unwrap();

  let job = controller
    .launch_job(JobRequest::generic("gc").with_max_retries(1))
    .await
    .unwrap();

  let failed = wait_for_state(&controller, &job.id, JobState::Error, Duration::from_secs(5)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 2, "original run plus one retry");
  assert_eq!(failed.retry_count, 1);
  assert!(
    failed.error.as_deref().unwrap_or_default().contains("forced failure"),
    "terminal error captures the runner's message"
  );

  controller.shutdown(Some(Duration::from_secs(2))).await.unwrap();
}

#[tokio::test]
async fn zero_budget_fails_on_first_error() {
  setup_tracing();
  let counter = Arc::new(AtomicUsize::new(0));
  let controller = base_builder(1)
    .register_runner(
      "gc",
      Arc::new(CountingRunner {
        counter: counter.clone(),
        delay: Duration::ZERO,
        succeeds: false,
      }),
    )
    .build()
    .unwrap();

  let job = controller.launch_job(JobRequest::generic("gc")).await.unwrap();
  wait_for_state(&controller, &job.id, JobState::Error, Duration::from_secs(3)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 1);

  controller.shutdown(Some(Duration::from_secs(2))).await.unwrap();
}
