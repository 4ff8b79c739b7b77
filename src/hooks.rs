//! Webhook status notification.
//!
//! State transitions are committed first; delivery happens afterwards on a
//! dedicated background task fed through a channel, so a slow or dead hook
//! endpoint never blocks a job's own state progression. Delivery is
//! reliable-best-effort: exponential backoff across a bounded number of
//! attempts, then the event is logged and dropped.

use crate::error::DeliveryError;
use crate::job::{JobId, JobState};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HOOK_CHANNEL_BOUND: usize = 256;

/// The JSON body POSTed to a status hook.
///
/// `revision` tracks state transitions; `sequence` moves on every emitted
/// event (check-ins included), so `(job_id, sequence)` is distinct per
/// callback and receivers can discard stale or duplicate deliveries without
/// losing check-in pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookPayload {
  pub job_id: JobId,
  pub state: JobState,
  pub revision: u64,
  pub sequence: u64,
  pub check_in: Option<String>,
  pub timestamp: DateTime<Utc>,
}

/// One queued notification: where to deliver plus what to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct HookEvent {
  pub hook_url: String,
  pub payload: HookPayload,
}

/// Transport used to deliver a single webhook callback.
///
/// The HTTP implementation is the production default; tests substitute a
/// recording fake.
#[async_trait]
pub trait HookDelivery: Send + Sync {
  async fn deliver(&self, url: &str, payload: &HookPayload) -> Result<(), DeliveryError>;
}

/// `reqwest`-based delivery: JSON POST, any 2xx counts as delivered.
#[derive(Debug, Default)]
pub struct HttpHookDelivery {
  client: reqwest::Client,
}

impl HttpHookDelivery {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl HookDelivery for HttpHookDelivery {
  async fn deliver(&self, url: &str, payload: &HookPayload) -> Result<(), DeliveryError> {
    let response = self
      .client
      .post(url)
      .json(payload)
      .send()
      .await
      .map_err(|e| DeliveryError::Transport(e.to_string()))?;
    let status = response.status();
    if status.is_success() {
      Ok(())
    } else {
      Err(DeliveryError::Status(status.as_u16()))
    }
  }
}

/// Handle for enqueueing webhook notifications.
///
/// `notify` is fire-and-forget from the caller's perspective: if the internal
/// queue is full the event is counted and dropped, surfacing only as an
/// observability signal.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
  event_tx: mpsc::Sender<HookEvent>,
}

impl WebhookNotifier {
  /// Spawns the delivery task and returns the notifier handle plus the task
  /// handle for shutdown joining.
  pub(crate) fn start(
    delivery: Arc<dyn HookDelivery>,
    max_attempts: u32,
    backoff_base: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
  ) -> (Self, JoinHandle<()>) {
    let (event_tx, mut event_rx) = mpsc::channel::<HookEvent>(HOOK_CHANNEL_BOUND);

    let handle = tokio::spawn(async move {
      info!("Webhook notifier started.");
      loop {
        tokio::select! {
          biased;

          Ok(()) = shutdown_rx.changed() => {
            if *shutdown_rx.borrow() {
              info!("Webhook notifier received shutdown signal.");
              break;
            }
          }

          maybe_event = event_rx.recv() => {
            match maybe_event {
              Some(event) => {
                // Per-event task so one slow endpoint cannot head-of-line
                // block deliveries for other jobs.
                let delivery = delivery.clone();
                tokio::spawn(async move {
                  deliver_with_retry(delivery, event, max_attempts, backoff_base).await;
                });
              }
              None => {
                debug!("Hook event channel closed, notifier exiting.");
                break;
              }
            }
          }
        }
      }
      info!("Webhook notifier task shutting down.");
    });

    (Self { event_tx }, handle)
  }

  /// Enqueues an event without blocking the state-transition path.
  pub(crate) fn notify(&self, event: HookEvent) {
    if let Err(e) = self.event_tx.try_send(event) {
      warn!(error = %e, "Dropping webhook event (queue full or notifier stopped).");
    }
  }
}

async fn deliver_with_retry(
  delivery: Arc<dyn HookDelivery>,
  event: HookEvent,
  max_attempts: u32,
  backoff_base: Duration,
) {
  let job_id = event.payload.job_id.clone();
  for attempt in 0..max_attempts.max(1) {
    match delivery.deliver(&event.hook_url, &event.payload).await {
      Ok(()) => {
        debug!(
          %job_id,
          revision = event.payload.revision,
          attempt,
          "Webhook delivered."
        );
        return;
      }
      Err(e) => {
        warn!(
          %job_id,
          revision = event.payload.revision,
          attempt,
          error = %e,
          "Webhook delivery attempt failed."
        );
        if attempt + 1 < max_attempts {
          let backoff = backoff_base * 2u32.saturating_pow(attempt);
          tokio::time::sleep(backoff).await;
        }
      }
    }
  }
  warn!(
    %job_id,
    hook_url = %event.hook_url,
    revision = event.payload.revision,
    "Webhook delivery permanently failed after exhausting retries."
  );
}
