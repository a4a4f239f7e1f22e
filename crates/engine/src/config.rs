//! Process configuration of one worker, read from the environment.
//!
//! | variable             | meaning                                         | default     |
//! |----------------------|-------------------------------------------------|-------------|
//! | `WORKER_TASK`        | stage name                                      | required    |
//! | `WORKER_ID`          | replica index                                   | required    |
//! | `RABBITMQ_ADDRESS`   | broker address                                  | required    |
//! | `STORAGE_ADDRESS`    | `http://..`, `ws://host:port` or `mem://`       | required    |
//! | `TOPOLOGY_PATH`      | topology TOML                                   | `topology.toml` |
//! | `LOG_MESSAGES`       | log payload previews                            | `false`     |
//! | `DEDUP_MODE`         | `off`, `message`, `records`/`json`, `lines`, `csv` | `message` |
//! | `CONNECT_ATTEMPTS`   | broker connection attempts                      | `15`        |
//! | `CONNECT_BACKOFF_MS` | delay between attempts                          | `1000`      |
//! | `WORKER_STREAMS`     | exit after this many streams terminate          | run until the broker closes |

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::broker::RetryPolicy;
use crate::dedup::{DedupMode, JsonArrayCodec, LinesCodec};
use crate::persistence::{HttpKvStore, KeyValueStore, StoreConfig, SurrealKvStore, TracingKvStore};
use crate::worker::{RunMode, WorkerOptions};
use crate::{Error, Result, WorkerId};

const DEFAULT_TOPOLOGY_PATH: &str = "topology.toml";

/// Where durable stream state lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// The key-value HTTP service.
    Http(String),
    /// SurrealDB, embedded (`mem://`) or remote (`ws://`).
    Surreal(StoreConfig),
}

impl FromStr for StorageBackend {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        if address.starts_with("http://") || address.starts_with("https://") {
            return Ok(Self::Http(address.to_string()));
        }
        if address == "mem://" {
            return Ok(Self::Surreal(StoreConfig::in_memory()));
        }
        if address.starts_with("ws://") || address.starts_with("wss://") {
            return Ok(Self::Surreal(StoreConfig::remote(address)));
        }
        Err(Error::invalid_config(format!(
            "unsupported STORAGE_ADDRESS '{address}'"
        )))
    }
}

impl StorageBackend {
    /// Connect the backend, wrapped in operation logging.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailed` if the backend cannot be reached.
    pub async fn open(&self) -> Result<Arc<dyn KeyValueStore>> {
        match self {
            Self::Http(base) => Ok(Arc::new(TracingKvStore::new(HttpKvStore::new(base)?))),
            Self::Surreal(config) => Ok(Arc::new(TracingKvStore::new(
                SurrealKvStore::connect(config).await?,
            ))),
        }
    }
}

/// Parse a `DEDUP_MODE` value.
///
/// # Errors
///
/// Returns `InvalidConfig` for an unknown mode.
pub fn parse_dedup_mode(value: &str) -> Result<DedupMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" => Ok(DedupMode::Off),
        "message" => Ok(DedupMode::Message),
        "records" | "json" => Ok(DedupMode::records(JsonArrayCodec)),
        "lines" => Ok(DedupMode::records(LinesCodec::default())),
        "csv" => Ok(DedupMode::records(LinesCodec::with_header())),
        other => Err(Error::invalid_config(format!(
            "unknown DEDUP_MODE '{other}'"
        ))),
    }
}

/// Everything a worker process needs at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stage and replica this process runs
    pub worker: WorkerId,
    /// Broker address
    pub broker_address: String,
    /// Durable storage
    pub storage: StorageBackend,
    /// Topology file
    pub topology_path: PathBuf,
    /// Log payload previews
    pub log_messages: bool,
    /// Dedup granularity
    pub dedup: DedupMode,
    /// Broker connection retry
    pub retry: RetryPolicy,
    /// When the worker stops
    pub run_mode: RunMode,
}

impl WorkerConfig {
    /// Read configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a missing required variable or an
    /// unparsable value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| Error::invalid_config(format!("{name} is not set")))
        };

        let stage = required("WORKER_TASK")?;
        let replica: usize = parse_var("WORKER_ID", &required("WORKER_ID")?)?;
        let broker_address = required("RABBITMQ_ADDRESS")?;
        let storage = required("STORAGE_ADDRESS")?.parse()?;

        let topology_path = lookup("TOPOLOGY_PATH")
            .map_or_else(|| PathBuf::from(DEFAULT_TOPOLOGY_PATH), PathBuf::from);

        let log_messages = lookup("LOG_MESSAGES")
            .map(|v| parse_bool("LOG_MESSAGES", &v))
            .transpose()?
            .unwrap_or(false);

        let dedup = lookup("DEDUP_MODE")
            .map(|v| parse_dedup_mode(&v))
            .transpose()?
            .unwrap_or_default();

        let defaults = RetryPolicy::default();
        let attempts = lookup("CONNECT_ATTEMPTS")
            .map(|v| parse_var::<u32>("CONNECT_ATTEMPTS", &v))
            .transpose()?
            .unwrap_or(defaults.attempts);
        if attempts == 0 {
            return Err(Error::invalid_config("CONNECT_ATTEMPTS must be at least 1"));
        }
        let backoff = lookup("CONNECT_BACKOFF_MS")
            .map(|v| parse_var::<u64>("CONNECT_BACKOFF_MS", &v))
            .transpose()?
            .map_or(defaults.base_delay, Duration::from_millis);

        let run_mode = match lookup("WORKER_STREAMS")
            .map(|v| parse_var::<usize>("WORKER_STREAMS", &v))
            .transpose()?
        {
            None => RunMode::UntilClosed,
            Some(0) => return Err(Error::invalid_config("WORKER_STREAMS must be at least 1")),
            Some(streams) => RunMode::Streams(streams),
        };

        Ok(Self {
            worker: WorkerId::new(stage, replica),
            broker_address,
            storage,
            topology_path,
            log_messages,
            dedup,
            retry: RetryPolicy::fixed(attempts, backoff),
            run_mode,
        })
    }

    /// Read configuration from the process environment.
    ///
    /// # Errors
    ///
    /// See [`from_lookup`](Self::from_lookup).
    pub fn from_env() -> Result<Self> {
        let config = Self::from_lookup(|name| std::env::var(name).ok())?;
        info!(
            worker = %config.worker,
            broker = %config.broker_address,
            topology = %config.topology_path.display(),
            "Loaded worker configuration"
        );
        Ok(config)
    }

    /// Worker options derived from this configuration.
    #[must_use]
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions::default()
            .with_dedup(self.dedup.clone())
            .with_run_mode(self.run_mode)
            .with_message_logging(self.log_messages)
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::invalid_config(format!("invalid {name} value '{value}': {e}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::invalid_config(format!(
            "invalid {name} value '{value}'"
        ))),
    }
}
