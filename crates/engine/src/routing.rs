//! Outbound routing for one stage replica.

use std::sync::Arc;

use tracing::debug;

use crate::broker::{Broker, Route};
use crate::envelope::{OutboundMessage, ShardKey};
use crate::hashing::shard_for;
use crate::topology::Topology;
use crate::{CorrelationId, Error, Result, WorkerId};

/// Resolve the route of a data message bound for `to`.
///
/// Unsharded stages share one queue and ignore the shard key. Sharded stages
/// need a key, and every message with the same key reaches the same replica.
///
/// # Errors
///
/// - `UnknownStage` if `to` is not declared
/// - `MissingShardKey` if `to` is sharded and `shard` is `Unsharded`
/// - `InvalidConfig` if `shard` names a replica `to` does not have
pub fn resolve_route(topology: &Topology, to: &str, payload: &[u8], shard: &ShardKey) -> Result<Route> {
    if !topology.is_sharded(to)? {
        return Ok(Route::shared(to));
    }
    let replicas = topology.replica_count(to)?;
    let replica = match shard {
        ShardKey::Unsharded => {
            return Err(Error::MissingShardKey {
                stage: to.to_string(),
            });
        }
        ShardKey::Key(key) => shard_for(key.as_bytes(), replicas),
        ShardKey::ContentHash => shard_for(payload, replicas),
        ShardKey::Replica(index) if *index < replicas => *index,
        ShardKey::Replica(index) => {
            return Err(Error::invalid_config(format!(
                "replica {index} out of range, stage '{to}' has {replicas}"
            )));
        }
    };
    Ok(Route::replica(to, replica))
}

/// Route of the done-marker addressed to `replica` of `to`.
///
/// # Errors
///
/// Returns `UnknownStage` if `to` is not declared.
pub fn done_route(topology: &Topology, to: &str, replica: usize) -> Result<Route> {
    if topology.is_sharded(to)? {
        Ok(Route::replica(to, replica))
    } else {
        Ok(Route::shared(to))
    }
}

/// Publishing handle of one stage replica.
///
/// Every publish failure is returned to the caller and is fatal to the
/// worker; nothing is retried here.
#[derive(Clone)]
pub struct StageOutput {
    broker: Arc<dyn Broker>,
    topology: Arc<Topology>,
    sender: WorkerId,
    log_messages: bool,
}

impl std::fmt::Debug for StageOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageOutput")
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}

impl StageOutput {
    /// Create the output of `sender`.
    pub fn new(broker: Arc<dyn Broker>, topology: Arc<Topology>, sender: WorkerId) -> Self {
        Self {
            broker,
            topology,
            sender,
            log_messages: false,
        }
    }

    /// Log a preview of every outgoing payload at debug level.
    #[must_use]
    pub const fn with_message_logging(mut self, enabled: bool) -> Self {
        self.log_messages = enabled;
        self
    }

    /// Identity stamped on done-markers.
    #[must_use]
    pub const fn sender(&self) -> &WorkerId {
        &self.sender
    }

    /// Topology this output routes by.
    #[must_use]
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Downstream stages of the sender's stage.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` if the sender's stage is not declared.
    pub fn downstream(&self) -> Result<&[String]> {
        self.topology.downstream_of(self.sender.stage())
    }

    fn check_edge(&self, to: &str) -> Result<()> {
        if !self.topology.contains(to) {
            return Err(Error::unknown_stage(to));
        }
        if !self.topology.is_edge(self.sender.stage(), to) {
            return Err(Error::NotDownstream {
                from: self.sender.stage().to_string(),
                to: to.to_string(),
            });
        }
        Ok(())
    }

    /// Publish a data message to `to`.
    ///
    /// # Errors
    ///
    /// - `UnknownStage` or `NotDownstream` for a stage outside the sender's edges
    /// - `MissingShardKey` for a sharded stage without a key
    /// - `PublishFailed` if the broker rejects the message
    pub async fn send(
        &self,
        payload: impl Into<Vec<u8>> + Send,
        to: &str,
        correlation_id: &CorrelationId,
        shard: ShardKey,
    ) -> Result<()> {
        self.check_edge(to)?;
        let payload = payload.into();
        let route = resolve_route(&self.topology, to, &payload, &shard)?;

        if self.log_messages {
            debug!(
                sender = %self.sender,
                queue = %route.queue(),
                correlation_id = %correlation_id,
                preview = %String::from_utf8_lossy(payload.get(..payload.len().min(120)).unwrap_or_default()),
                "Sending message"
            );
        }

        self.broker
            .publish(&route, OutboundMessage::data(correlation_id.clone(), payload))
            .await
    }

    /// Send one done-marker to every replica of `to`, each addressed to its
    /// replica index. Returns the number of markers sent.
    ///
    /// # Errors
    ///
    /// - `UnknownStage` or `NotDownstream` for a stage outside the sender's edges
    /// - `PublishFailed` if the broker rejects a marker
    pub async fn send_done(&self, to: &str, correlation_id: &CorrelationId) -> Result<usize> {
        self.check_edge(to)?;
        let replicas = self.topology.replica_count(to)?;
        for replica in 0..replicas {
            let route = done_route(&self.topology, to, replica)?;
            self.broker
                .publish(
                    &route,
                    OutboundMessage::done(correlation_id.clone(), self.sender.clone(), replica),
                )
                .await?;
        }
        debug!(
            sender = %self.sender,
            stage = to,
            correlation_id = %correlation_id,
            replicas,
            "Sent done-markers"
        );
        Ok(replicas)
    }

    /// Send done-markers to every downstream stage, in declaration order.
    ///
    /// # Errors
    ///
    /// Propagates the first [`send_done`](Self::send_done) failure.
    pub async fn send_done_all(&self, correlation_id: &CorrelationId) -> Result<usize> {
        let mut total: usize = 0;
        for stage in self.downstream()? {
            total = total.saturating_add(self.send_done(stage, correlation_id).await?);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::envelope::MessageKind;
    use crate::topology::{StageSpec, TopologyConfig};

    fn topology() -> Arc<Topology> {
        let config = TopologyConfig::new()
            .with_stage(StageSpec::new("parser", 2).to("filter").to("join"))
            .with_stage(StageSpec::new("filter", 2))
            .with_stage(StageSpec::new("join", 3).sharded());
        Arc::new(Topology::from_config(&config).expect("valid"))
    }

    async fn setup() -> (InMemoryBroker, StageOutput) {
        let broker = InMemoryBroker::new();
        broker.declare_stage("filter", 2, false).await.unwrap();
        broker.declare_stage("join", 3, true).await.unwrap();
        let output = StageOutput::new(Arc::new(broker.clone()), topology(), WorkerId::new("parser", 0));
        (broker, output)
    }

    #[test]
    fn same_key_lands_on_same_replica() {
        let topology = topology();
        let first = resolve_route(&topology, "join", b"payload-1", &ShardKey::key("42")).unwrap();
        let second = resolve_route(&topology, "join", b"payload-2", &ShardKey::key("42")).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Route::replica("join", shard_for(b"42", 3)));
    }

    #[test]
    fn sharded_stage_requires_key() {
        let result = resolve_route(&topology(), "join", b"x", &ShardKey::Unsharded);
        assert!(matches!(result, Err(Error::MissingShardKey { .. })));
    }

    #[test]
    fn unsharded_stage_uses_shared_queue() {
        let route = resolve_route(&topology(), "filter", b"x", &ShardKey::key("ignored")).unwrap();
        assert_eq!(route, Route::shared("filter"));
    }

    #[test]
    fn explicit_replica_must_exist() {
        let route = resolve_route(&topology(), "join", b"x", &ShardKey::Replica(2)).unwrap();
        assert_eq!(route, Route::replica("join", 2));

        let result = resolve_route(&topology(), "join", b"x", &ShardKey::Replica(4));
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn send_done_addresses_every_replica() {
        let (broker, output) = setup().await;
        let cid = CorrelationId::new("s1");

        assert_eq!(output.send_done("filter", &cid).await.unwrap(), 2);
        let shared = broker.published(&Route::shared("filter"));
        let targets: Vec<usize> = shared
            .iter()
            .filter_map(|m| match &m.properties.kind {
                MessageKind::Done(marker) => Some(marker.target_replica),
                MessageKind::Data => None,
            })
            .collect();
        assert_eq!(targets, vec![0, 1]);

        assert_eq!(output.send_done_all(&cid).await.unwrap(), 5);
        for replica in 0..3 {
            let queue = broker.published(&Route::replica("join", replica));
            assert_eq!(queue.len(), 1);
            assert!(queue[0].is_done());
        }
    }

    #[tokio::test]
    async fn sending_outside_the_edges_is_rejected() {
        let broker = InMemoryBroker::new();
        broker.declare_stage("parser", 2, false).await.unwrap();
        let output = StageOutput::new(Arc::new(broker), topology(), WorkerId::new("filter", 0));
        let cid = CorrelationId::new("s1");

        let result = output.send(b"x".to_vec(), "parser", &cid, ShardKey::Unsharded).await;
        assert!(matches!(result, Err(Error::NotDownstream { .. })));
        let result = output.send_done("ghost", &cid).await;
        assert!(matches!(result, Err(Error::UnknownStage { .. })));
    }

    #[tokio::test]
    async fn publish_failure_is_returned() {
        let (broker, output) = setup().await;
        broker.fail_publishes(true).unwrap();
        let result = output
            .send(b"x".to_vec(), "filter", &CorrelationId::new("s1"), ShardKey::Unsharded)
            .await;
        assert!(matches!(result, Err(Error::PublishFailed { .. })));
    }
}
