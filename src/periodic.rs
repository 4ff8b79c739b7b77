//! Periodic scheduling of cron-defined jobs.
//!
//! A dedicated ticker task owns the table of standing definitions. Every due
//! definition emits exactly one spawn request through the shared submission
//! channel, so spawned instances travel the same dedup + queue path as ad-hoc
//! submissions. `next_fire` always advances to the first cron time strictly
//! after now, which bounds catch-up after an outage to a single firing.

use crate::error::{LaunchError, OpError, StoreError};
use crate::job::{JobId, JobRequest};

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const TICK_PERIOD: Duration = Duration::from_secs(1);
/// A due time older than this is treated as missed rather than current.
const MISFIRE_GRACE_SECS: i64 = 2;

/// What to do with firings that became due while the scheduler was not
/// running (process down, long pause).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MisfirePolicy {
  /// Emit a single catch-up firing for the whole missed span, then resume
  /// the normal cadence.
  #[default]
  FireOnce,
  /// Drop missed windows entirely; fire only at the next on-time slot.
  Skip,
}

/// A standing cron definition held by the scheduler.
///
/// `id` is the definition record's job ID; spawned instances carry it as
/// their `upstream_id`.
#[derive(Debug, Clone)]
pub(crate) struct PeriodicDefinition {
  pub id: JobId,
  pub request: JobRequest,
  schedule: Schedule,
  next_fire: Option<DateTime<Utc>>,
}

impl PeriodicDefinition {
  /// Parses the cron expression out of the request metadata. A missing or
  /// unparseable expression is a validation failure; no definition record
  /// should exist for it.
  pub(crate) fn new(id: JobId, request: JobRequest) -> Result<Self, LaunchError> {
    let expr = request
      .metadata
      .cron
      .as_deref()
      .ok_or_else(|| LaunchError::Validation("periodic job requires a cron expression".into()))?;
    let schedule = Schedule::from_str(expr)
      .map_err(|e| LaunchError::Validation(format!("invalid cron expression '{expr}': {e}")))?;
    let next_fire = schedule.after(&Utc::now()).next();
    Ok(Self {
      id,
      request,
      schedule,
      next_fire,
    })
  }
}

/// A firing forwarded to the controller's submission pump.
#[derive(Debug)]
pub(crate) struct SpawnRequest {
  pub definition_id: JobId,
  pub request: JobRequest,
}

enum Command {
  Register {
    definition: PeriodicDefinition,
    responder: oneshot::Sender<()>,
  },
  Unregister {
    definition_id: JobId,
    responder: oneshot::Sender<bool>,
  },
}

/// Handle to the ticker task; owned by the controller.
#[derive(Clone)]
pub(crate) struct PeriodicScheduler {
  cmd_tx: mpsc::Sender<Command>,
}

impl PeriodicScheduler {
  /// Spawns the ticker task. Due firings are pushed into `spawn_tx`.
  pub(crate) fn start(
    misfire_policy: MisfirePolicy,
    spawn_tx: mpsc::Sender<SpawnRequest>,
    shutdown_rx: watch::Receiver<bool>,
  ) -> (Self, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(32);
    let handle = tokio::spawn(async move {
      ticker_loop(misfire_policy, cmd_rx, spawn_tx, shutdown_rx).await;
    });
    (Self { cmd_tx }, handle)
  }

  /// Adds a definition to the ticker's table.
  pub(crate) async fn register(&self, definition: PeriodicDefinition) -> Result<(), LaunchError> {
    let (responder, ack) = oneshot::channel();
    self
      .cmd_tx
      .send(Command::Register {
        definition,
        responder,
      })
      .await
      .map_err(|_| LaunchError::Shutdown)?;
    ack.await.map_err(|_| LaunchError::Shutdown)
  }

  /// Removes a definition; already-spawned instances are unaffected.
  /// Returns whether the definition was present.
  pub(crate) async fn unregister(&self, definition_id: &JobId) -> Result<bool, OpError> {
    let (responder, ack) = oneshot::channel();
    self
      .cmd_tx
      .send(Command::Unregister {
        definition_id: definition_id.clone(),
        responder,
      })
      .await
      .map_err(|_| OpError::Store(StoreError::Unavailable("periodic scheduler stopped".into())))?;
    ack
      .await
      .map_err(|_| OpError::Store(StoreError::Unavailable("periodic scheduler stopped".into())))
  }
}

async fn ticker_loop(
  misfire_policy: MisfirePolicy,
  mut cmd_rx: mpsc::Receiver<Command>,
  spawn_tx: mpsc::Sender<SpawnRequest>,
  mut shutdown_rx: watch::Receiver<bool>,
) {
  info!(?misfire_policy, "Periodic scheduler started.");
  let mut definitions: HashMap<JobId, PeriodicDefinition> = HashMap::new();
  let mut tick = tokio::time::interval(TICK_PERIOD);
  tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      biased;

      Ok(()) = shutdown_rx.changed() => {
        if *shutdown_rx.borrow() {
          info!("Periodic scheduler received shutdown signal.");
          break;
        }
      }

      maybe_cmd = cmd_rx.recv() => {
        match maybe_cmd {
          Some(Command::Register { definition, responder }) => {
            debug!(
              definition_id = %definition.id,
              job_name = %definition.request.name,
              next_fire = ?definition.next_fire,
              "Registered periodic definition."
            );
            definitions.insert(definition.id.clone(), definition);
            let _ = responder.send(());
          }
          Some(Command::Unregister { definition_id, responder }) => {
            let removed = definitions.remove(&definition_id).is_some();
            debug!(%definition_id, removed, "Unregister periodic definition.");
            let _ = responder.send(removed);
          }
          None => {
            info!("Periodic scheduler command channel closed, exiting.");
            break;
          }
        }
      }

      _ = tick.tick() => {
        fire_due(&mut definitions, misfire_policy, &spawn_tx).await;
      }
    }
  }
  info!("Periodic scheduler task shutting down.");
}

async fn fire_due(
  definitions: &mut HashMap<JobId, PeriodicDefinition>,
  misfire_policy: MisfirePolicy,
  spawn_tx: &mpsc::Sender<SpawnRequest>,
) {
  let now = Utc::now();
  for definition in definitions.values_mut() {
    let Some(due) = definition.next_fire else {
      continue;
    };
    if due > now {
      continue;
    }

    let missed = (now - due).num_seconds() > MISFIRE_GRACE_SECS;
    let should_fire = !missed || misfire_policy == MisfirePolicy::FireOnce;
    if should_fire {
      debug!(
        definition_id = %definition.id,
        job_name = %definition.request.name,
        %due,
        catch_up = missed,
        "Periodic definition due, spawning instance."
      );
      let spawn = SpawnRequest {
        definition_id: definition.id.clone(),
        request: definition.request.clone(),
      };
      if spawn_tx.send(spawn).await.is_err() {
        warn!(
          definition_id = %definition.id,
          "Submission channel closed; dropping periodic firing."
        );
      }
    } else {
      debug!(
        definition_id = %definition.id,
        %due,
        "Skipping missed firing per misfire policy."
      );
    }

    // Strictly after `now`: a whole missed span collapses into the single
    // firing above (or none), never a burst.
    definition.next_fire = definition.schedule.after(&now).next();
  }
}
