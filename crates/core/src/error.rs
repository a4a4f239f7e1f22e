//! Error taxonomy for the stagewise engine.
//!
//! Every error carries an [`ErrorKind`] so call sites decide between retrying,
//! absorbing a duplicate, or terminating the worker with plain control flow.

use std::path::PathBuf;

use thiserror::Error;

/// How a caller is expected to react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Retry with backoff (broker connection establishment only).
    Transient,
    /// Terminate the worker; a supervisor restarts it and recovery runs again.
    Fatal,
    /// Already observed; acknowledge and ignore.
    Duplicate,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Duplicate => "duplicate",
        };
        f.write_str(label)
    }
}

/// Errors raised by topology validation, routing, storage, and the worker runtime.
#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("invalid topology: {reason}")]
    InvalidTopology { reason: String },

    #[error("unknown stage '{stage}'")]
    UnknownStage { stage: String },

    #[error("stage '{to}' is not downstream of '{from}'")]
    NotDownstream { from: String, to: String },

    #[error("stage '{stage}' is sharded and requires a shard key")]
    MissingShardKey { stage: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // Broker errors
    #[error("broker at '{address}' unavailable: {reason}")]
    BrokerUnavailable { address: String, reason: String },

    #[error("could not connect to broker at '{address}' after {attempts} attempts")]
    ConnectFailed { address: String, attempts: u32 },

    #[error("publish to '{queue}' failed: {reason}")]
    PublishFailed { queue: String, reason: String },

    #[error("consume from '{queue}' failed: {reason}")]
    ConsumeFailed { queue: String, reason: String },

    #[error("acknowledgement of delivery {tag} failed: {reason}")]
    AckFailed { tag: u64, reason: String },

    // Storage errors
    #[error("storage {operation} of '{namespace}/{key}' failed: {reason}")]
    StorageFailed {
        operation: &'static str,
        namespace: String,
        key: String,
        reason: String,
    },

    // Codec errors
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    #[error("invalid record: {reason}")]
    InvalidRecord { reason: String },

    // Duplicates
    #[error("duplicate message {hash} on stream '{correlation_id}'")]
    DuplicateMessage {
        correlation_id: String,
        hash: String,
    },

    #[error("duplicate done-marker from '{sender}' on stream '{correlation_id}'")]
    DuplicateDoneMarker {
        correlation_id: String,
        sender: String,
    },

    // Stage errors
    #[error("no handler registered for stage '{stage}'")]
    HandlerNotFound { stage: String },

    #[error("stage '{stage}' failed: {reason}")]
    StageFailed { stage: String, reason: String },

    #[error("stream '{correlation_id}': {source}")]
    Stream {
        correlation_id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to read '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BrokerUnavailable { .. } => ErrorKind::Transient,
            Self::DuplicateMessage { .. } | Self::DuplicateDoneMarker { .. } => {
                ErrorKind::Duplicate
            }
            Self::Stream { source, .. } => source.kind(),
            _ => ErrorKind::Fatal,
        }
    }

    /// Whether the operation may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Whether the error must terminate the worker.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }

    /// Create an invalid topology error.
    pub fn invalid_topology(reason: impl Into<String>) -> Self {
        Self::InvalidTopology {
            reason: reason.into(),
        }
    }

    /// Create an unknown stage error.
    pub fn unknown_stage(stage: impl Into<String>) -> Self {
        Self::UnknownStage {
            stage: stage.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a transient broker error.
    pub fn broker_unavailable(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BrokerUnavailable {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a publish error.
    pub fn publish_failed(queue: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PublishFailed {
            queue: queue.into(),
            reason: reason.into(),
        }
    }

    /// Create a consume error.
    pub fn consume_failed(queue: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConsumeFailed {
            queue: queue.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage error.
    pub fn storage_failed(
        operation: &'static str,
        namespace: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::StorageFailed {
            operation,
            namespace: namespace.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization {
            reason: reason.into(),
        }
    }

    /// Create an invalid record error.
    pub fn invalid_record(reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            reason: reason.into(),
        }
    }

    /// Create a stage failure.
    pub fn stage_failed(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StageFailed {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Create a file read error.
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
