//! End-to-end runs of a small pipeline fed by a client.
//!
//! Following BDD naming convention: given_<context>_when_<action>_then_<outcome>

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Collector, Forwarder, ends, worker};
use stagewise_engine::{
    Broker, CorrelationId, DedupMode, Error, InMemoryBroker, InMemoryKvStore, LinesCodec,
    PipelineClient, Result, RunMode, StageHandler, StageOutput, StageSpec, Topology,
    TopologyConfig, WorkerId, WorkerOptions, WorkerReport, csv_chunks,
};
use tokio::task::JoinHandle;

const CSV: &str = "id,city\n1,Lyon\n2,Oslo\n3,Lima\n4,Kyiv\n5,Pune\n";

fn topology() -> Result<Arc<Topology>> {
    let config = TopologyConfig::new()
        .with_stage(StageSpec::new("client", 1).to("parse"))
        .with_stage(StageSpec::new("parse", 2).to("filter"))
        .with_stage(StageSpec::new("filter", 1).to("sink"))
        .with_stage(StageSpec::new("sink", 1));
    Ok(Arc::new(Topology::from_config(&config)?))
}

fn spawn(
    id: WorkerId,
    topology: &Arc<Topology>,
    broker: &InMemoryBroker,
    store: &Arc<InMemoryKvStore>,
    handler: Arc<dyn StageHandler>,
) -> Result<JoinHandle<Result<WorkerReport>>> {
    let options = WorkerOptions::default()
        .with_dedup(DedupMode::records(LinesCodec::with_header()))
        .with_run_mode(RunMode::Streams(1));
    let runner = worker(id, topology, broker, store, options)?;
    Ok(tokio::spawn(async move { runner.run(handler.as_ref()).await }))
}

async fn join(task: JoinHandle<Result<WorkerReport>>) -> Result<WorkerReport> {
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .map_err(|_| Error::stage_failed("pipeline", "worker timed out"))?
        .map_err(|e| Error::stage_failed("pipeline", e.to_string()))?
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn given_duplicated_upload_when_pipeline_runs_then_sink_sees_each_row_once() -> Result<()> {
    // GIVEN: parse (2 replicas) -> filter -> sink, all deduplicating CSV rows
    let topology = topology()?;
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryKvStore::new());
    for stage in ["parse", "filter", "sink"] {
        broker
            .declare_stage(stage, topology.replica_count(stage)?, topology.is_sharded(stage)?)
            .await?;
    }

    let sink = Collector::default();
    let mut tasks = vec![
        spawn(WorkerId::new("parse", 0), &topology, &broker, &store, Arc::new(Forwarder))?,
        spawn(WorkerId::new("parse", 1), &topology, &broker, &store, Arc::new(Forwarder))?,
        spawn(WorkerId::new("filter", 0), &topology, &broker, &store, Arc::new(Forwarder))?,
    ];
    let sink_task = spawn(WorkerId::new("sink", 0), &topology, &broker, &store, Arc::new(sink.clone()))?;

    // WHEN: the client uploads the CSV with one chunk sent twice
    let client = PipelineClient::new(StageOutput::new(
        Arc::new(broker.clone()),
        Arc::clone(&topology),
        WorkerId::new("client", 0),
    ));
    let mut chunks = csv_chunks(CSV, 2)?;
    if let Some(first) = chunks.first().cloned() {
        chunks.push(first);
    }
    let cid = CorrelationId::new("request-1");
    assert_eq!(client.upload(&cid, chunks).await?, 4);

    for task in tasks.drain(..) {
        assert_eq!(join(task).await?.streams_terminated, 1);
    }
    let sink_report = join(sink_task).await?;

    // THEN: every row once, one end, and the header kept on each chunk
    let events = sink.snapshot().await;
    let mut rows: Vec<String> = events
        .iter()
        .filter_map(|e| e.payload())
        .flat_map(|p| {
            String::from_utf8_lossy(p)
                .lines()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|line| line != "id,city")
        .collect();
    rows.sort();
    assert_eq!(rows, vec!["1,Lyon", "2,Oslo", "3,Lima", "4,Kyiv", "5,Pune"]);
    assert_eq!(ends(&events), 1);
    assert!(
        events
            .iter()
            .filter_map(|e| e.payload())
            .all(|p| p.starts_with(b"id,city\n"))
    );
    assert_eq!(sink_report.streams_terminated, 1);
    Ok(())
}
