//! tests/reconcile.rs
//! Restart reconciliation of records orphaned by a previous process.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dockhand::store::{JobStore, MemoryJobStore};
use dockhand::{JobKind, JobRecord, JobState};

use crate::common::{base_builder, setup_tracing};

fn leftover_record(id: &str, state: JobState) -> JobRecord {
  let now = Utc::now();
  JobRecord {
    id: id.to_string(),
    name: "replicate_image".to_string(),
    parameters: Default::default(),
    kind: JobKind::Generic,
    state,
    revision: 2,
    sequence: 2,
    retry_count: 0,
    max_retries: 0,
    check_in: None,
    error: None,
    creation_time: now,
    update_time: now,
    enqueue_time: Some(now),
    status_hook: None,
    upstream_id: None,
  }
}

#[tokio::test]
async fn running_leftovers_are_parked_as_orphaned() {
  setup_tracing();
  let store = Arc::new(MemoryJobStore::new());
  store
    .create(&leftover_record("aaaa1111", JobState::Running))
    .await
    .unwrap();
  store
    .create(&leftover_record("bbbb2222", JobState::Retrying))
    .await
    .unwrap();
  store
    .create(&leftover_record("cccc3333", JobState::Success))
    .await
    .unwrap();

  let controller = base_builder(1).job_store(store).build().unwrap();
  let reconciled = controller.reconcile().await.unwrap();
  assert_eq!(reconciled, 2);

  for id in ["aaaa1111", "bbbb2222"] {
    let stats = controller.get_job(id).await.unwrap();
    assert_eq!(stats.state, JobState::Error);
    assert!(stats.error.as_deref().unwrap_or_default().contains("orphaned"));
    assert!(stats.revision > 2, "reconciliation is a real transition");
  }

  // Terminal leftovers are untouched.
  let done = controller.get_job("cccc3333").await.unwrap();
  assert_eq!(done.state, JobState::Success);
  assert_eq!(done.revision, 2);

  controller.shutdown(Some(Duration::from_secs(2))).await.unwrap();
}
