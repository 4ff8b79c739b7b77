//! # Dockhand
//!
//! An asynchronous job orchestration core for container-registry maintenance
//! work (replication, garbage collection, scanning, ...), built on tokio.
//!
//! The crate is a library: HTTP transport, configuration stores, and durable
//! storage engines stay outside, reached through narrow traits. The public
//! surface is the [`JobController`] façade, assembled with a builder.
//!
//! ## Core behavior
//!
//! *   **Deduplicated submission:** at most one in-flight job per
//!     `(name, parameters)` fingerprint, enforced by an atomic uniqueness
//!     marker with a TTL. Terminal jobs free their slot.
//! *   **Explicit lifecycle:** `Pending`, `Running`, `Retrying`, `Success`,
//!     `Error`, `Stopped`, `Cancelled`. Every transition is validated,
//!     persisted before it counts, and stamped with a monotonically
//!     increasing revision.
//! *   **Bounded worker pool:** a fixed number of workers over a bounded FIFO
//!     queue; a full queue rejects submissions with `QueueFull` instead of
//!     buffering without limit.
//! *   **Cooperative cancellation:** stop/cancel requests flip the recorded
//!     state immediately and signal the running job through a token; nothing
//!     is hard-killed.
//! *   **Cron scheduling:** periodic definitions fire `ScheduledInstance`
//!     jobs on a cron cadence; an outage is caught up with at most one
//!     firing.
//! *   **Webhook status hooks:** each state change is POSTed to the job's
//!     hook URL from a background task with bounded retries, never blocking
//!     the job itself.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use dockhand::{
//!   JobController, JobParameters, JobRequest, JobRunner, RunContext, RunError,
//! };
//!
//! struct ReplicateImage;
//!
//! #[async_trait]
//! impl JobRunner for ReplicateImage {
//!   async fn run(&self, ctx: RunContext, params: JobParameters) -> Result<(), RunError> {
//!     let image = params
//!       .get("image")
//!       .and_then(|v| v.as_str())
//!       .ok_or_else(|| RunError::msg("missing 'image' parameter"))?;
//!     ctx.log(&format!("replicating {image}"))
//!       .await
//!       .map_err(|e| RunError::msg(e.to_string()))?;
//!     if ctx.is_cancelled() {
//!       return Ok(());
//!     }
//!     // ... copy manifests and layers ...
//!     Ok(())
//!   }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let controller = JobController::builder()
//!     .worker_count(4)
//!     .register_runner("replicate_image", Arc::new(ReplicateImage))
//!     .build()?;
//!
//!   let stats = controller
//!     .launch_job(
//!       JobRequest::generic("replicate_image").with_param("image", "library/ubuntu:latest"),
//!     )
//!     .await?;
//!   println!("submitted job {}", stats.id);
//!
//!   controller.shutdown(None).await?;
//!   Ok(())
//! }
//! ```

pub mod controller;
pub mod dedup;
pub mod error;
pub mod hooks;
pub mod job;
pub mod state;
pub mod store;

mod periodic;
mod pool;

pub use controller::{ControllerBuilder, JobController};
pub use error::{BuildError, LaunchError, OpError, ShutdownError, StoreError};
pub use job::runner::{JobRegistry, JobRunner, RunContext, RunError};
pub use job::{
  JobAction, JobId, JobKind, JobMetadata, JobParameters, JobRecord, JobRequest, JobState,
  JobStats, PoolStats, RetryPolicy,
};
pub use periodic::MisfirePolicy;
