//! Identifier newtypes.

use serde::{Deserialize, Serialize};

/// Identifies one end-to-end client request flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Create a correlation id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of one replica of a stage.
///
/// Displays as `stage_replica`, which doubles as the worker's storage
/// namespace and as its sender identity on done-markers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId {
    stage: String,
    replica: usize,
}

impl WorkerId {
    /// Create a worker identity.
    pub fn new(stage: impl Into<String>, replica: usize) -> Self {
        Self {
            stage: stage.into(),
            replica,
        }
    }

    /// The stage this worker runs.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// The replica index within the stage.
    #[must_use]
    pub const fn replica(&self) -> usize {
        self.replica
    }

    /// Storage namespace owned by this worker.
    #[must_use]
    pub fn namespace(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.stage, self.replica)
    }
}
