//! CLI command definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// stagewise - fault-tolerant staged dataflow
#[derive(Parser, Debug)]
#[command(name = "stagewise")]
#[command(version)]
#[command(about = "Validate topologies and run staged dataflow pipelines")]
#[command(
    long_about = "stagewise checks pipeline topologies, validates worker environments, runs stage replicas against RabbitMQ, and runs whole pipelines in-process with crash-safe termination and dedup."
)]
pub struct Cli {
    /// Serve GET /status on this port while the command runs
    #[arg(long, global = true)]
    pub liveness_port: Option<u16>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a topology file and print its stages
    Check {
        /// Topology TOML file
        topology: PathBuf,
    },

    /// Validate the worker environment (WORKER_TASK, WORKER_ID, ...)
    Preflight,

    /// Run the stage replica named by the environment against RabbitMQ
    Worker,

    /// Run every replica of every stage in-process over an in-memory broker
    RunLocal {
        /// Topology TOML file
        topology: PathBuf,

        /// CSV file uploaded by every client stage
        #[arg(short, long)]
        input: PathBuf,

        /// Data rows per uploaded chunk
        #[arg(short, long, default_value_t = 100)]
        lines: usize,

        /// Dedup mode: off, message, records, lines, csv
        #[arg(short, long, default_value = "csv")]
        dedup: String,

        /// Correlation id of the uploaded stream
        #[arg(long, default_value = "local-run")]
        stream: String,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_local_defaults() {
        let cli = Cli::try_parse_from(["stagewise", "run-local", "t.toml", "--input", "in.csv"]);
        assert!(matches!(
            cli,
            Ok(Cli {
                liveness_port: None,
                command: Commands::RunLocal { lines: 100, ref dedup, .. },
            }) if dedup == "csv"
        ));
    }

    #[test]
    fn worker_takes_everything_from_the_environment() {
        let cli = Cli::try_parse_from(["stagewise", "worker", "--liveness-port", "9000"]);
        assert!(matches!(
            cli,
            Ok(Cli {
                liveness_port: Some(9000),
                command: Commands::Worker,
            })
        ));
        assert!(Cli::try_parse_from(["stagewise", "worker", "extra"]).is_err());
    }

    #[test]
    fn liveness_port_is_global() {
        let cli = Cli::try_parse_from(["stagewise", "check", "t.toml", "--liveness-port", "8080"]);
        assert!(matches!(cli, Ok(Cli { liveness_port: Some(8080), .. })));
    }
}
