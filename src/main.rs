//! # stagewise
//!
//! Command-line entry point.
//!
//! - `check` validates a topology and prints each stage's wiring
//! - `preflight` validates a worker's environment, storage and broker
//! - `worker` runs the stage replica named by the environment against RabbitMQ
//! - `run-local` runs a whole topology in-process over one uploaded CSV
//!
//! Any fatal error ends the process with a non-zero status and a message
//! naming the failing stage or stream.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod cli;
mod liveness;
mod local;
mod preflight;
mod worker;

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use stagewise_engine::{CorrelationId, Topology, parse_dedup_mode};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let liveness = match cli.liveness_port {
        Some(port) => Some(liveness::spawn(port).await?),
        None => None,
    };

    let result = match cli.command {
        Commands::Check { topology } => check(&topology),
        Commands::Preflight => {
            let startup = preflight::run().await?;
            println!("{} ready", startup.config.worker);
            Ok(())
        }
        Commands::Worker => {
            let report = worker::run().await?;
            println!(
                "streams={} delivered={} replayed={} duplicates={} markers_forwarded={}",
                report.streams_terminated,
                report.messages_delivered,
                report.messages_replayed,
                report.duplicates_dropped,
                report.markers_forwarded
            );
            Ok(())
        }
        Commands::RunLocal {
            topology,
            input,
            lines,
            dedup,
            stream,
        } => run_local(&topology, &input, lines, &dedup, stream).await,
    };

    if let Some((_, handle)) = liveness {
        handle.abort();
    }
    result
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn check(path: &Path) -> Result<()> {
    let topology = Topology::load(path)
        .with_context(|| format!("Invalid topology {}", path.display()))?;

    for stage in topology.topological_order() {
        let downstream = topology.downstream_of(stage)?;
        println!(
            "{stage}: replicas={} sharded={} expected_upstream={} next=[{}]",
            topology.replica_count(stage)?,
            topology.is_sharded(stage)?,
            topology.expected_upstream(stage)?,
            downstream.join(", ")
        );
    }
    info!(stages = topology.len(), "Topology is valid");
    Ok(())
}

async fn run_local(
    topology: &Path,
    input: &Path,
    lines: usize,
    dedup: &str,
    stream: String,
) -> Result<()> {
    let start = Instant::now();
    let topology = Topology::load(topology)
        .with_context(|| format!("Invalid topology {}", topology.display()))?;
    let dedup = parse_dedup_mode(dedup)?;

    let run = local::run(
        topology,
        local::LocalOptions {
            input,
            lines,
            dedup,
            stream: CorrelationId::new(stream),
        },
    )
    .await?;

    for (worker, report) in &run.workers {
        println!(
            "{worker}: delivered={} replayed={} duplicates={} markers_forwarded={}",
            report.messages_delivered,
            report.messages_replayed,
            report.duplicates_dropped,
            report.markers_forwarded
        );
    }
    for (stage, rows) in &run.sink_rows {
        println!("{stage}: {rows} rows");
    }
    info!(elapsed = ?start.elapsed(), workers = run.workers.len(), "Local run complete");
    Ok(())
}
