//! Done-barrier over an arbitrary fan-in.
//!
//! A stream finishes at a stage replica once a done-marker from every
//! upstream replica has been recorded. Senders are kept as a set, so a
//! redelivered marker never counts twice.

use tracing::{debug, info};

use crate::envelope::DoneMarker;
use crate::state::StreamStateStore;
use crate::topology::Topology;
use crate::{CorrelationId, Result, WorkerId};

/// Lifecycle of a stream at one stage replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Data is flowing; no done-marker recorded yet.
    Active,
    /// Some, but not all, upstream replicas are done.
    AwaitingFanIn,
    /// Fan-in complete; done-markers not yet forwarded.
    DonePendingForward,
    /// Forwarded and discarded.
    Terminated,
}

/// What a done-marker did to its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneOutcome {
    /// Sender already recorded, or the stream was already forwarded;
    /// acknowledge and ignore.
    Duplicate,
    /// Addressed to another replica of this stage.
    Misrouted,
    /// Sender is not an upstream replica of this stage.
    Foreign,
    /// Recorded, fan-in still incomplete.
    Recorded {
        /// Distinct senders recorded so far
        received: usize,
        /// Senders required
        expected: usize,
    },
    /// Recorded, fan-in complete.
    Complete,
}

/// Fan-in bookkeeping for one stage replica.
#[derive(Debug, Clone)]
pub struct TerminationDetector {
    worker: WorkerId,
    expected: usize,
    upstream: Vec<(String, usize)>,
}

impl TerminationDetector {
    /// Build the detector for `worker` from the topology.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if the worker's stage is not declared.
    pub fn new(topology: &Topology, worker: &WorkerId) -> Result<Self> {
        let expected = topology.expected_upstream(worker.stage())?;
        let upstream = topology
            .upstream_of(worker.stage())?
            .into_iter()
            .map(|stage| Ok((stage.to_string(), topology.replica_count(stage)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            worker: worker.clone(),
            expected,
            upstream,
        })
    }

    /// Number of done-markers needed to finish a stream.
    #[must_use]
    pub const fn expected(&self) -> usize {
        self.expected
    }

    fn is_upstream(&self, sender: &WorkerId) -> bool {
        self.upstream
            .iter()
            .any(|(stage, replicas)| stage == sender.stage() && sender.replica() < *replicas)
    }

    /// Whether the recorded markers satisfy the fan-in.
    #[must_use]
    pub fn is_satisfied(&self, state: &StreamStateStore, correlation_id: &CorrelationId) -> bool {
        self.expected > 0 && state.done_received(correlation_id) >= self.expected
    }

    /// Current phase of a stream.
    #[must_use]
    pub fn phase(&self, state: &StreamStateStore, correlation_id: &CorrelationId) -> StreamPhase {
        if state.is_done_sent(correlation_id) {
            return StreamPhase::Terminated;
        }
        match state.done_received(correlation_id) {
            0 if state.is_active(correlation_id) => StreamPhase::Active,
            0 => StreamPhase::Terminated,
            _ if self.is_satisfied(state, correlation_id) => StreamPhase::DonePendingForward,
            _ => StreamPhase::AwaitingFanIn,
        }
    }

    /// Record a done-marker, persisting before the caller acknowledges it.
    ///
    /// # Errors
    ///
    /// Returns `StorageFailed` if the updated counts cannot be persisted.
    pub async fn observe(
        &self,
        state: &mut StreamStateStore,
        correlation_id: &CorrelationId,
        marker: &DoneMarker,
    ) -> Result<DoneOutcome> {
        if marker.target_replica != self.worker.replica() {
            return Ok(DoneOutcome::Misrouted);
        }
        if !self.is_upstream(&marker.sender) {
            return Ok(DoneOutcome::Foreign);
        }

        let sender = marker.sender.to_string();
        if state.is_done_sent(correlation_id) {
            debug!(
                worker = %self.worker,
                correlation_id = %correlation_id,
                sender = %sender,
                "Done-marker for a forwarded stream"
            );
            return Ok(DoneOutcome::Duplicate);
        }
        if !state.record_done(correlation_id, &sender).await? {
            debug!(
                worker = %self.worker,
                correlation_id = %correlation_id,
                sender = %sender,
                "Duplicate done-marker"
            );
            return Ok(DoneOutcome::Duplicate);
        }

        let received = state.done_received(correlation_id);
        if self.is_satisfied(state, correlation_id) {
            info!(
                worker = %self.worker,
                correlation_id = %correlation_id,
                received,
                "Fan-in complete"
            );
            Ok(DoneOutcome::Complete)
        } else {
            debug!(
                worker = %self.worker,
                correlation_id = %correlation_id,
                sender = %sender,
                received,
                expected = self.expected,
                "Recorded done-marker"
            );
            Ok(DoneOutcome::Recorded {
                received,
                expected: self.expected,
            })
        }
    }
}
