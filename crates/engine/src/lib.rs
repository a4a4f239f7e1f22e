//! Fault-tolerant staged dataflow over a message broker.
//!
//! A fixed DAG of stages, each replicated, exchanges batches tagged with a
//! correlation id. This crate provides:
//!
//! - **Topology**: stage graph, replica counts, expected fan-in
//! - **Routing**: shared queues for unsharded stages, stable shard hashing for sharded ones
//! - **Termination**: per-stream done barrier across every upstream replica
//! - **Dedup and replay**: content-hash dedup with a durable per-stream log
//! - **Recovery**: pending forwards and active streams restored before live traffic
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stagewise_engine::{
//!     InMemoryBroker, InMemoryKvStore, Topology, TopologyConfig, StageSpec, Worker, WorkerId,
//! };
//!
//! #[tokio::main]
//! async fn main() -> stagewise_engine::Result<()> {
//!     let config = TopologyConfig::new()
//!         .with_stage(StageSpec::new("client", 1).to("parse"))
//!         .with_stage(StageSpec::new("parse", 2));
//!     let topology = Arc::new(Topology::from_config(&config)?);
//!
//!     let worker = Worker::new(
//!         WorkerId::new("parse", 0),
//!         topology,
//!         Arc::new(InMemoryBroker::new()),
//!         Arc::new(InMemoryKvStore::new()),
//!     )?;
//!     let report = worker.run(&my_handler).await?;
//!     println!("{} streams", report.streams_terminated);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod broker;
pub mod client;
pub mod config;
pub mod dedup;
pub mod envelope;
pub mod hashing;
pub mod persistence;
pub mod registry;
pub mod routing;
pub mod state;
pub mod termination;
pub mod topology;
pub mod worker;

pub use stagewise_core::{CorrelationId, Error, ErrorKind, Result, ResultExt, WorkerId};

pub use broker::{
    AmqpBroker, Broker, Consumer, Delivery, InMemoryBroker, QueueName, RetryPolicy, Route,
    connect_with_retry,
};
pub use client::{PipelineClient, csv_chunks};
pub use config::{StorageBackend, WorkerConfig, parse_dedup_mode};
pub use dedup::{DedupMode, JsonArrayCodec, LinesCodec, RecordCodec};
pub use envelope::{DoneMarker, MessageKind, OutboundMessage, ShardKey, StreamEvent};
pub use persistence::{
    HttpKvStore, InMemoryKvStore, KeyValueStore, StoreConfig, SurrealKvStore, TracingKvStore,
};
pub use registry::{EventHandler, PerEvent, StageHandler, StageRegistry};
pub use routing::StageOutput;
pub use state::StreamStateStore;
pub use termination::{DoneOutcome, StreamPhase, TerminationDetector};
pub use topology::{StageSpec, Topology, TopologyConfig};
pub use worker::{RunMode, StageInput, Worker, WorkerOptions, WorkerReport};
