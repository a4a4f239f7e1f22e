//! One stage replica against RabbitMQ and durable storage.

use std::sync::Arc;

use anyhow::{Context, Result};
use stagewise_engine::{Worker, WorkerReport};
use tracing::info;

use crate::{local, preflight};

/// Run the worker named by the environment until its input ends.
///
/// Stages with no downstream count rows; every other stage relays its input.
///
/// # Errors
///
/// Any failed startup check, and any fatal error of the worker.
pub async fn run() -> Result<WorkerReport> {
    let startup = preflight::run().await?;
    let (registry, _sinks) = local::handlers(&startup.topology)?;
    let id = startup.config.worker.clone();

    let worker = Worker::new(
        id.clone(),
        Arc::clone(&startup.topology),
        Arc::new(startup.broker),
        startup.store,
    )?
    .with_options(startup.config.worker_options());

    info!(worker = %id, "Starting worker");
    worker
        .run_registered(&registry)
        .await
        .with_context(|| format!("Worker {id} failed"))
}
