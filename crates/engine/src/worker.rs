//! # Worker runtime
//!
//! Runs one stage replica: declares its queues, recovers persisted streams,
//! then feeds the stage handler a pull-based sequence of [`StreamEvent`]s.
//!
//! ## Ordering guarantees
//!
//! - A data message is logged before it is yielded and acknowledged only when
//!   the handler pulls the next item.
//! - A done-marker is recorded durably before it is acknowledged.
//! - Once the handler has seen `End` for a stream and pulls again, done-markers
//!   go downstream, the `done_sent` tombstone is persisted, and the rest of
//!   the stream state is dropped. Later markers for that stream are
//!   acknowledged as duplicates.
//!
//! ## Recovery
//!
//! Streams whose fan-in completed before a crash are replayed and forwarded
//! first, then the logs of all other active streams are replayed, then live
//! consumption resumes.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{Broker, Consumer, Delivery, DeliveryTag, Route};
use crate::dedup::{Admission, DedupMode, Deduplicator};
use crate::envelope::{DoneMarker, MessageKind, StreamEvent};
use crate::persistence::KeyValueStore;
use crate::registry::{StageHandler, StageRegistry};
use crate::routing::StageOutput;
use crate::state::StreamStateStore;
use crate::termination::{DoneOutcome, TerminationDetector};
use crate::topology::Topology;
use crate::{CorrelationId, Error, Result, ResultExt, WorkerId};

/// When the input sequence ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Until the broker closes the subscription.
    #[default]
    UntilClosed,
    /// After this many streams have terminated.
    Streams(usize),
}

/// Tunables of a worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Duplicate suppression granularity
    pub dedup: DedupMode,
    /// When to stop
    pub run_mode: RunMode,
    /// Log payload previews at debug level
    pub log_messages: bool,
}

impl WorkerOptions {
    /// Set the dedup mode.
    #[must_use]
    pub fn with_dedup(mut self, dedup: DedupMode) -> Self {
        self.dedup = dedup;
        self
    }

    /// Set the run mode.
    #[must_use]
    pub const fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    /// Enable payload logging.
    #[must_use]
    pub const fn with_message_logging(mut self, enabled: bool) -> Self {
        self.log_messages = enabled;
        self
    }
}

/// Counters of a worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Streams forwarded and discarded
    pub streams_terminated: usize,
    /// Data events yielded from live traffic
    pub messages_delivered: usize,
    /// Data events yielded from persisted logs
    pub messages_replayed: usize,
    /// Messages dropped as already seen
    pub duplicates_dropped: usize,
    /// Done-markers dropped as already recorded
    pub duplicate_markers: usize,
    /// Done-markers handed back for another replica
    pub misrouted_markers: usize,
    /// Done-markers published downstream
    pub markers_forwarded: usize,
}

enum Recovered {
    Replay {
        correlation_id: CorrelationId,
        payload: Vec<u8>,
    },
    End {
        correlation_id: CorrelationId,
    },
}

/// Pull-based input of a stage handler.
pub struct StageInput {
    worker: WorkerId,
    route: Route,
    consumer: Box<dyn Consumer>,
    output: StageOutput,
    state: StreamStateStore,
    termination: TerminationDetector,
    dedup: Deduplicator,
    recovered: VecDeque<Recovered>,
    pending_ack: Option<DeliveryTag>,
    pending_forward: Option<CorrelationId>,
    run_mode: RunMode,
    log_messages: bool,
    report: WorkerReport,
}

impl std::fmt::Debug for StageInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageInput")
            .field("worker", &self.worker)
            .field("route", &self.route)
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

impl StageInput {
    /// Worker this input belongs to.
    #[must_use]
    pub const fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// Counters so far.
    #[must_use]
    pub const fn report(&self) -> WorkerReport {
        self.report
    }

    /// Durable stream state, for inspection.
    #[must_use]
    pub const fn state(&self) -> &StreamStateStore {
        &self.state
    }

    /// Next event, or `None` when the input is exhausted.
    ///
    /// Pulling acknowledges the previously returned delivery and completes any
    /// forwarding owed for a stream whose `End` was returned last.
    ///
    /// # Errors
    ///
    /// Broker, storage and codec failures. All are fatal.
    pub async fn next(&mut self) -> Result<Option<StreamEvent>> {
        self.settle().await?;

        loop {
            if let RunMode::Streams(limit) = self.run_mode {
                if self.report.streams_terminated >= limit {
                    return Ok(None);
                }
            }

            if let Some(item) = self.recovered.pop_front() {
                return Ok(Some(self.yield_recovered(item)));
            }

            let Some(delivery) = self.consumer.next().await? else {
                debug!(worker = %self.worker, "Input closed");
                return Ok(None);
            };

            let correlation_id = delivery.properties.correlation_id.clone();
            let event = match delivery.properties.kind.clone() {
                MessageKind::Done(marker) => self.on_done(delivery.tag, &correlation_id, &marker).await,
                MessageKind::Data => self.on_data(delivery).await,
            }
            .with_stream(&correlation_id)?;

            if let Some(event) = event {
                return Ok(Some(event));
            }
        }
    }

    /// Acknowledge the last item and run any pending forward.
    ///
    /// Called by [`Worker::run`] after the handler returns.
    ///
    /// # Errors
    ///
    /// Broker and storage failures.
    pub async fn finish(&mut self) -> Result<WorkerReport> {
        self.settle().await?;
        Ok(self.report)
    }

    async fn settle(&mut self) -> Result<()> {
        if let Some(tag) = self.pending_ack.take() {
            self.consumer.ack(tag).await?;
        }
        if let Some(correlation_id) = self.pending_forward.take() {
            self.forward(&correlation_id).await.with_stream(&correlation_id)?;
        }
        Ok(())
    }

    fn yield_recovered(&mut self, item: Recovered) -> StreamEvent {
        match item {
            Recovered::Replay {
                correlation_id,
                payload,
            } => {
                self.report.messages_replayed = self.report.messages_replayed.saturating_add(1);
                StreamEvent::Data {
                    correlation_id,
                    payload,
                }
            }
            Recovered::End { correlation_id } => {
                self.pending_forward = Some(correlation_id.clone());
                StreamEvent::End { correlation_id }
            }
        }
    }

    async fn on_done(
        &mut self,
        tag: DeliveryTag,
        correlation_id: &CorrelationId,
        marker: &DoneMarker,
    ) -> Result<Option<StreamEvent>> {
        let outcome = self
            .termination
            .observe(&mut self.state, correlation_id, marker)
            .await?;

        match outcome {
            DoneOutcome::Misrouted => {
                let requeue = matches!(self.route, Route::Shared { .. });
                if !requeue {
                    warn!(
                        worker = %self.worker,
                        correlation_id = %correlation_id,
                        target = marker.target_replica,
                        "Done-marker for another replica on a replica queue, dropping"
                    );
                }
                self.consumer.nack(tag, requeue).await?;
                self.report.misrouted_markers = self.report.misrouted_markers.saturating_add(1);
                // Let the addressed replica reach the requeued marker.
                tokio::task::yield_now().await;
                Ok(None)
            }
            DoneOutcome::Foreign => {
                warn!(
                    worker = %self.worker,
                    correlation_id = %correlation_id,
                    sender = %marker.sender,
                    "Done-marker from a stage that is not upstream, dropping"
                );
                self.consumer.ack(tag).await?;
                Ok(None)
            }
            DoneOutcome::Duplicate => {
                self.consumer.ack(tag).await?;
                self.report.duplicate_markers = self.report.duplicate_markers.saturating_add(1);
                Ok(None)
            }
            DoneOutcome::Recorded { .. } => {
                self.consumer.ack(tag).await?;
                Ok(None)
            }
            DoneOutcome::Complete => {
                self.consumer.ack(tag).await?;
                self.pending_forward = Some(correlation_id.clone());
                Ok(Some(StreamEvent::End {
                    correlation_id: correlation_id.clone(),
                }))
            }
        }
    }

    async fn on_data(&mut self, delivery: Delivery) -> Result<Option<StreamEvent>> {
        let correlation_id = delivery.properties.correlation_id;

        if self.log_messages {
            debug!(
                worker = %self.worker,
                correlation_id = %correlation_id,
                redelivered = delivery.redelivered,
                preview = %String::from_utf8_lossy(delivery.body.get(..delivery.body.len().min(120)).unwrap_or_default()),
                "Received message"
            );
        }

        match self.dedup.admit(&correlation_id, &delivery.body)? {
            Admission::Passthrough(payload) => {
                self.pending_ack = Some(delivery.tag);
                self.report.messages_delivered = self.report.messages_delivered.saturating_add(1);
                Ok(Some(StreamEvent::Data {
                    correlation_id,
                    payload,
                }))
            }
            Admission::Duplicate { dropped } => {
                debug!(
                    worker = %self.worker,
                    correlation_id = %correlation_id,
                    dropped,
                    "Dropping duplicate"
                );
                self.consumer.ack(delivery.tag).await?;
                self.report.duplicates_dropped = self.report.duplicates_dropped.saturating_add(1);
                Ok(None)
            }
            Admission::Accept { body, seq, hashes } => {
                self.state.mark_active(&correlation_id).await?;
                self.state
                    .append_log(&correlation_id, seq, body.clone())
                    .await?;
                self.dedup.commit(&correlation_id, hashes);
                self.pending_ack = Some(delivery.tag);
                self.report.messages_delivered = self.report.messages_delivered.saturating_add(1);
                debug!(worker = %self.worker, correlation_id = %correlation_id, seq, "Accepted message");
                Ok(Some(StreamEvent::Data {
                    correlation_id,
                    payload: body,
                }))
            }
        }
    }

    async fn forward(&mut self, correlation_id: &CorrelationId) -> Result<()> {
        if !self.state.is_done_sent(correlation_id) {
            let sent = self.output.send_done_all(correlation_id).await?;
            self.report.markers_forwarded = self.report.markers_forwarded.saturating_add(sent);
            self.state.mark_done_sent(correlation_id).await?;
        }
        self.state.discard(correlation_id).await?;
        self.dedup.forget(correlation_id);
        self.report.streams_terminated = self.report.streams_terminated.saturating_add(1);

        info!(
            worker = %self.worker,
            correlation_id = %correlation_id,
            "Stream terminated"
        );
        Ok(())
    }

    async fn replay(&mut self, correlation_id: &CorrelationId) -> Result<usize> {
        if !self.dedup.mode().is_enabled() {
            return Ok(0);
        }
        let log = self.state.read_log(correlation_id).await?;
        let replayed = log.len();
        for payload in log {
            self.dedup.restore(correlation_id, &payload)?;
            self.recovered.push_back(Recovered::Replay {
                correlation_id: correlation_id.clone(),
                payload,
            });
        }
        Ok(replayed)
    }

    async fn recover(&mut self) -> Result<()> {
        let leftover: Vec<CorrelationId> = self.state.undiscarded_streams().cloned().collect();
        for correlation_id in &leftover {
            info!(
                worker = %self.worker,
                correlation_id = %correlation_id,
                "Finishing discard of a forwarded stream"
            );
            self.state.discard(correlation_id).await.with_stream(correlation_id)?;
        }

        let pending: Vec<CorrelationId> = self
            .state
            .tracked_streams()
            .filter(|cid| self.termination.is_satisfied(&self.state, cid))
            .cloned()
            .collect();
        for correlation_id in &pending {
            let replayed = self.replay(correlation_id).await.with_stream(correlation_id)?;
            self.recovered.push_back(Recovered::End {
                correlation_id: correlation_id.clone(),
            });
            info!(
                worker = %self.worker,
                correlation_id = %correlation_id,
                replayed,
                "Stream completed before restart, forwarding"
            );
        }

        let active: Vec<CorrelationId> = self
            .state
            .active_streams()
            .filter(|cid| !pending.contains(cid))
            .cloned()
            .collect();
        for correlation_id in &active {
            let replayed = self.replay(correlation_id).await.with_stream(correlation_id)?;
            debug!(
                worker = %self.worker,
                correlation_id = %correlation_id,
                replayed,
                "Replaying stream log"
            );
        }

        info!(
            worker = %self.worker,
            discarded = leftover.len(),
            pending_forward = pending.len(),
            active = active.len(),
            queued = self.recovered.len(),
            "Recovery complete"
        );
        Ok(())
    }
}

/// One replica of a stage, wired to its broker and store.
pub struct Worker {
    id: WorkerId,
    topology: Arc<Topology>,
    broker: Arc<dyn Broker>,
    store: Arc<dyn KeyValueStore>,
    options: WorkerOptions,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Create a worker.
    ///
    /// # Errors
    ///
    /// - `UnknownStage` if the stage is not in the topology
    /// - `InvalidConfig` if the replica index is out of range
    pub fn new(
        id: WorkerId,
        topology: Arc<Topology>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let replicas = topology.replica_count(id.stage())?;
        if id.replica() >= replicas {
            return Err(Error::invalid_config(format!(
                "replica {} out of range, stage '{}' has {replicas}",
                id.replica(),
                id.stage()
            )));
        }
        Ok(Self {
            id,
            topology,
            broker,
            store,
            options: WorkerOptions::default(),
        })
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Identity of this worker.
    #[must_use]
    pub const fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Route this worker consumes from.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if the stage is not declared.
    pub fn input_route(&self) -> Result<Route> {
        if self.topology.is_sharded(self.id.stage())? {
            Ok(Route::replica(self.id.stage(), self.id.replica()))
        } else {
            Ok(Route::shared(self.id.stage()))
        }
    }

    /// Publishing handle of this worker.
    #[must_use]
    pub fn output(&self) -> StageOutput {
        StageOutput::new(
            Arc::clone(&self.broker),
            Arc::clone(&self.topology),
            self.id.clone(),
        )
        .with_message_logging(self.options.log_messages)
    }

    async fn declare(&self, stage: &str) -> Result<()> {
        self.broker
            .declare_stage(
                stage,
                self.topology.replica_count(stage)?,
                self.topology.is_sharded(stage)?,
            )
            .await
    }

    /// Declare queues, run recovery, and subscribe to the input queue.
    ///
    /// # Errors
    ///
    /// Any broker or storage failure; recovery may simply be retried.
    pub async fn open(&self) -> Result<(StageInput, StageOutput)> {
        self.declare(self.id.stage()).await?;
        for stage in self.topology.downstream_of(self.id.stage())? {
            self.declare(stage).await?;
        }

        let state = StreamStateStore::load(Arc::clone(&self.store), &self.id).await?;
        let termination = TerminationDetector::new(&self.topology, &self.id)?;
        let route = self.input_route()?;
        let consumer = self.broker.consume(&route).await?;
        let output = self.output();

        info!(
            worker = %self.id,
            queue = %route.queue(),
            expected_upstream = termination.expected(),
            "Worker subscribed"
        );

        let mut input = StageInput {
            worker: self.id.clone(),
            route,
            consumer,
            output: output.clone(),
            state,
            termination,
            dedup: Deduplicator::new(self.options.dedup.clone()),
            recovered: VecDeque::new(),
            pending_ack: None,
            pending_forward: None,
            run_mode: self.options.run_mode,
            log_messages: self.options.log_messages,
            report: WorkerReport::default(),
        };
        input.recover().await?;
        Ok((input, output))
    }

    /// Run `handler` over this worker's input until it is exhausted.
    ///
    /// # Errors
    ///
    /// The first fatal error from recovery, the handler, or settlement.
    pub async fn run(&self, handler: &dyn StageHandler) -> Result<WorkerReport> {
        let (mut input, output) = self.open().await?;
        handler
            .run(&mut input, &output)
            .await
            .inspect_error(|e| tracing::error!(worker = %self.id, error = %e, "Stage handler failed"))?;
        let report = input.finish().await?;
        info!(
            worker = %self.id,
            streams = report.streams_terminated,
            delivered = report.messages_delivered,
            replayed = report.messages_replayed,
            duplicates = report.duplicates_dropped,
            "Worker finished"
        );
        Ok(report)
    }

    /// Run the handler registered for this worker's stage.
    ///
    /// # Errors
    ///
    /// `HandlerNotFound`, or anything [`run`](Self::run) returns.
    pub async fn run_registered(&self, registry: &StageRegistry) -> Result<WorkerReport> {
        let handler = registry.get(self.id.stage())?;
        self.run(handler.as_ref()).await
    }
}
