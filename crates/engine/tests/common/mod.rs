//! Shared handlers and fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use stagewise_engine::{
    Error, InMemoryBroker, InMemoryKvStore, Result, ShardKey, StageHandler, StageInput,
    StageOutput, StageSpec, StreamEvent, Topology, TopologyConfig, Worker, WorkerId,
    WorkerOptions,
};
use tokio::sync::Mutex;

/// `a` (2 replicas) feeds `b` (1) which feeds `c` (1).
pub fn chain() -> Result<Arc<Topology>> {
    let config = TopologyConfig::new()
        .with_stage(StageSpec::new("a", 2).to("b"))
        .with_stage(StageSpec::new("b", 1).to("c"))
        .with_stage(StageSpec::new("c", 1));
    Ok(Arc::new(Topology::from_config(&config)?))
}

/// Build a worker over shared in-memory infrastructure.
pub fn worker(
    id: WorkerId,
    topology: &Arc<Topology>,
    broker: &InMemoryBroker,
    store: &Arc<InMemoryKvStore>,
    options: WorkerOptions,
) -> Result<Worker> {
    Ok(Worker::new(
        id,
        Arc::clone(topology),
        Arc::new(broker.clone()),
        Arc::clone(store) as Arc<dyn stagewise_engine::KeyValueStore>,
    )?
    .with_options(options))
}

/// Records every event it sees.
#[derive(Default, Clone)]
pub struct Collector {
    pub events: Arc<Mutex<Vec<StreamEvent>>>,
}

impl Collector {
    pub async fn snapshot(&self) -> Vec<StreamEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl StageHandler for Collector {
    async fn run(&self, input: &mut StageInput, _output: &StageOutput) -> Result<()> {
        while let Some(event) = input.next().await? {
            self.events.lock().await.push(event);
        }
        Ok(())
    }
}

/// Records events and fails right after the `n`-th one, leaving it
/// unacknowledged like a process killed mid-processing.
#[derive(Clone)]
pub struct CrashAfter {
    pub limit: usize,
    pub seen: Collector,
}

impl CrashAfter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            seen: Collector::default(),
        }
    }
}

#[async_trait]
impl StageHandler for CrashAfter {
    async fn run(&self, input: &mut StageInput, _output: &StageOutput) -> Result<()> {
        let mut count: usize = 0;
        while let Some(event) = input.next().await? {
            self.seen.events.lock().await.push(event);
            count = count.saturating_add(1);
            if count >= self.limit {
                return Err(Error::stage_failed(input.worker().stage(), "simulated crash"));
            }
        }
        Ok(())
    }
}

/// Sends every payload on to all downstream stages.
#[derive(Default, Clone, Copy)]
pub struct Forwarder;

#[async_trait]
impl StageHandler for Forwarder {
    async fn run(&self, input: &mut StageInput, output: &StageOutput) -> Result<()> {
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

/// Payloads of the data events, as strings.
pub fn payloads(events: &[StreamEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(StreamEvent::payload)
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect()
}

/// Number of end-of-stream events.
pub fn ends(events: &[StreamEvent]) -> usize {
    events.iter().filter(|e| e.is_end()).count()
}
