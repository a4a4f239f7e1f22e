//! Startup validation of a worker process environment.
//!
//! Checks, in order: the environment parses, the topology loads and names
//! this worker, the storage backend answers, and the broker accepts an AMQP
//! connection within the configured retry policy.

use std::sync::Arc;

use anyhow::{Context, Result};
use stagewise_engine::{
    AmqpBroker, KeyValueStore, Topology, WorkerConfig, WorkerId, connect_with_retry,
};
use tracing::info;

/// Everything a worker needs, validated and connected.
pub struct Startup {
    pub config: WorkerConfig,
    pub topology: Arc<Topology>,
    pub store: Arc<dyn KeyValueStore>,
    pub broker: AmqpBroker,
}

fn check_worker(topology: &Topology, worker: &WorkerId) -> Result<()> {
    let replicas = topology
        .replica_count(worker.stage())
        .with_context(|| format!("Worker stage '{}' is not in the topology", worker.stage()))?;
    anyhow::ensure!(
        worker.replica() < replicas,
        "Worker replica {} out of range, stage '{}' has {replicas}",
        worker.replica(),
        worker.stage()
    );
    Ok(())
}

/// Validate the environment of the current process and connect its
/// collaborators.
///
/// # Errors
///
/// Returns the first failing check.
pub async fn run() -> Result<Startup> {
    let config = WorkerConfig::from_env().context("Invalid worker environment")?;
    let topology = Topology::load(&config.topology_path)
        .with_context(|| format!("Invalid topology {}", config.topology_path.display()))?;
    check_worker(&topology, &config.worker)?;

    let store = config.storage.open().await.context("Storage unreachable")?;
    store
        .get(&config.worker.namespace(), "done_sent")
        .await
        .context("Storage read failed")?;
    info!(worker = %config.worker, "Storage reachable");

    let address = config.broker_address.as_str();
    let broker = connect_with_retry(address, config.retry, || AmqpBroker::connect(address))
        .await
        .context("Broker unreachable")?;

    Ok(Startup {
        topology: Arc::new(topology),
        store,
        broker,
        config,
    })
}
