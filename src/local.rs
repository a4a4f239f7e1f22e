//! In-process run of a whole topology.
//!
//! Every stage with no upstream acts as a client and uploads the input CSV.
//! Stages with no downstream count rows. Every other stage relays each
//! payload to all of its downstream stages, sharded by content hash.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::info;
use stagewise_engine::{
    Broker, CorrelationId, DedupMode, InMemoryBroker, InMemoryKvStore, KeyValueStore, PipelineClient,
    RunMode, ShardKey, StageHandler, StageInput, StageOutput, StageRegistry, StreamEvent, Topology,
    Worker, WorkerId, WorkerOptions, WorkerReport, csv_chunks,
};

/// Relays every payload downstream.
struct Relay;

#[async_trait]
impl StageHandler for Relay {
    async fn run(&self, input: &mut StageInput, output: &StageOutput) -> stagewise_engine::Result<()> {
        let downstream = output.downstream()?.to_vec();
        while let Some(event) = input.next().await? {
            if let StreamEvent::Data {
                correlation_id,
                payload,
            } = event
            {
                for stage in &downstream {
                    output
                        .send(payload.clone(), stage, &correlation_id, ShardKey::ContentHash)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// Counts data rows, skipping the header line of each chunk.
#[derive(Default)]
pub struct RowCounter {
    rows: AtomicUsize,
}

#[async_trait]
impl StageHandler for RowCounter {
    async fn run(&self, input: &mut StageInput, _output: &StageOutput) -> stagewise_engine::Result<()> {
        while let Some(event) = input.next().await? {
            match event {
                StreamEvent::Data { payload, .. } => {
                    let lines = payload.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count();
                    self.rows.fetch_add(lines.saturating_sub(1), Ordering::Relaxed);
                }
                StreamEvent::End { correlation_id } => {
                    info!(
                        worker = %input.worker(),
                        correlation_id = %correlation_id,
                        rows = self.rows.load(Ordering::Relaxed),
                        "Stream counted"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Outcome of a local run.
#[derive(Debug, Default)]
pub struct LocalRun {
    /// Rows counted per sink stage
    pub sink_rows: BTreeMap<String, usize>,
    /// Report of every worker
    pub workers: Vec<(WorkerId, WorkerReport)>,
}

/// Options of a local run.
pub struct LocalOptions<'a> {
    pub input: &'a Path,
    pub lines: usize,
    pub dedup: DedupMode,
    pub stream: CorrelationId,
}

/// Row counters for stages with no downstream, relays for the rest. Client
/// stages get no handler.
///
/// # Errors
///
/// Returns an error if the topology cannot be walked.
pub fn handlers(topology: &Topology) -> Result<(StageRegistry, BTreeMap<String, Arc<RowCounter>>)> {
    let mut registry = StageRegistry::new();
    let mut sinks = BTreeMap::new();
    for stage in topology.stages() {
        if topology.expected_upstream(stage)? == 0 {
            continue;
        }
        if topology.downstream_of(stage)?.is_empty() {
            let counter = Arc::new(RowCounter::default());
            sinks.insert(stage.to_string(), Arc::clone(&counter));
            registry.register(stage, counter)?;
        } else {
            registry.register(stage, Arc::new(Relay))?;
        }
    }
    Ok((registry, sinks))
}

/// Run `topology` to completion over one uploaded stream.
///
/// # Errors
///
/// Returns an error if the input cannot be read or any worker fails.
pub async fn run(topology: Topology, options: LocalOptions<'_>) -> Result<LocalRun> {
    let csv = tokio::fs::read_to_string(options.input)
        .await
        .with_context(|| format!("Failed to read input {}", options.input.display()))?;
    let chunks = csv_chunks(&csv, options.lines)?;

    let topology = Arc::new(topology);
    let broker = InMemoryBroker::new();
    let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::new());
    let (registry, sinks) = handlers(&topology)?;
    let registry = Arc::new(registry);
    let worker_options = WorkerOptions::default()
        .with_dedup(options.dedup)
        .with_run_mode(RunMode::Streams(1));

    // Queues must exist before the clients publish.
    for stage in topology.stages() {
        broker
            .declare_stage(stage, topology.replica_count(stage)?, topology.is_sharded(stage)?)
            .await?;
    }

    let mut tasks = Vec::new();
    for stage in registry.names() {
        for replica in 0..topology.replica_count(stage)? {
            let id = WorkerId::new(stage, replica);
            let worker = Worker::new(
                id.clone(),
                Arc::clone(&topology),
                Arc::new(broker.clone()),
                Arc::clone(&store),
            )?
            .with_options(worker_options.clone());
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let report = worker.run_registered(&registry).await?;
                Ok::<_, stagewise_engine::Error>((id, report))
            }));
        }
    }

    for client in topology.stages().filter(|s| !registry.has(s)) {
        let uploader = PipelineClient::new(StageOutput::new(
            Arc::new(broker.clone()),
            Arc::clone(&topology),
            WorkerId::new(client, 0),
        ));
        uploader.upload(&options.stream, chunks.clone()).await?;
    }

    let workers = try_join_all(tasks)
        .await
        .context("Worker task panicked")?
        .into_iter()
        .collect::<stagewise_engine::Result<Vec<_>>>()?;

    let sink_rows = sinks
        .into_iter()
        .map(|(stage, counter)| (stage, counter.rows.load(Ordering::Relaxed)))
        .collect();
    Ok(LocalRun { sink_rows, workers })
}
