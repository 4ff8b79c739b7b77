//! tests/backpressure.rs
//! Bounded queue: overload is rejected, never buffered without limit.

mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{base_builder, setup_tracing, wait_for_state, BlockUntilCancelledRunner};
use dockhand::{JobRequest, JobState, LaunchError};

#[tokio::test]
async fn overflowing_the_queue_rejects_with_queue_full() {
  setup_tracing();
  let controller = base_builder(1)
    .queue_capacity(1)
    .register_runner(
      "scan",
      Arc::new(BlockUntilCancelledRunner {
        observed_cancel: Arc::new(AtomicBool::new(false)),
      }),
    )
    .build()
    .unwrap();

  // First job occupies the single worker.
  let running = controller
    .launch_job(JobRequest::generic("scan").with_param("n", 1))
    .await
    .unwrap();
  wait_for_state(&controller, &running.id, JobState::Running, Duration::from_secs(3)).await;

  // Second fills the single queue slot.
  let queued = controller
    .launch_job(JobRequest::generic("scan").with_param("n", 2))
    .await
    .unwrap();

  // Third must be rejected with backpressure.
  let err = controller
    .launch_job(JobRequest::generic("scan").with_param("n", 3))
    .await
    .unwrap_err();
  assert!(matches!(err, LaunchError::QueueFull));

  // Nothing silently lost: the rejected submission is parked in Error.
  let status = controller.check_status().await.unwrap();
  assert_eq!(status.error, 1, "rejected submission is parked, not dropped");
  assert_eq!(status.queue_depth, 1);
  assert_eq!(status.queue_capacity, 1);
  assert_eq!(status.workers_busy, 1);

  // Parking released the marker, so the same submission is retriable once
  // capacity frees up.
  controller.stop_job(&running.id).await.unwrap();
  wait_for_state(&controller, &running.id, JobState::Stopped, Duration::from_secs(3)).await;
  let accepted = controller
    .launch_job(JobRequest::generic("scan").with_param("n", 3))
    .await
    .expect("resubmission must be accepted after capacity frees up");

  controller.stop_job(&queued.id).await.unwrap();
  controller.stop_job(&accepted.id).await.unwrap();
  controller.shutdown(Some(Duration::from_secs(2))).await.unwrap();
}
