//! Message broker contract.
//!
//! Unsharded stages consume from one shared queue named after the stage.
//! Sharded stages get one exclusive queue per replica, addressed by index.
//! Done-markers travel on the same queue as the data they close, so each
//! marker trails its sender's data in FIFO order.

mod amqp;
mod memory;
mod retry;

use std::fmt;

use async_trait::async_trait;

pub use amqp::{AmqpBroker, AmqpConsumer};
pub use memory::InMemoryBroker;
pub use retry::{RetryPolicy, connect_with_retry};

use crate::Result;
use crate::envelope::{MessageProperties, OutboundMessage};

/// Broker-assigned identifier of one delivery.
pub type DeliveryTag = u64;

/// Where a message is published.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    /// Shared work queue of an unsharded stage.
    Shared {
        /// Stage name
        stage: String,
    },
    /// Exclusive queue of one replica of a sharded stage.
    Replica {
        /// Stage name
        stage: String,
        /// Replica index
        replica: usize,
    },
}

impl Route {
    /// Shared queue of `stage`.
    pub fn shared(stage: impl Into<String>) -> Self {
        Self::Shared {
            stage: stage.into(),
        }
    }

    /// Replica queue `replica` of `stage`.
    pub fn replica(stage: impl Into<String>, replica: usize) -> Self {
        Self::Replica {
            stage: stage.into(),
            replica,
        }
    }

    /// Queue this route resolves to.
    #[must_use]
    pub fn queue(&self) -> QueueName {
        match self {
            Self::Shared { stage } => QueueName(stage.clone()),
            Self::Replica { stage, replica } => QueueName(format!("{stage}.{replica}")),
        }
    }
}

/// Name of a broker queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueName(String);

impl QueueName {
    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer, pending acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Tag used to ack or nack
    pub tag: DeliveryTag,
    /// Metadata
    pub properties: MessageProperties,
    /// Raw body
    pub body: Vec<u8>,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
}

impl Delivery {
    /// Rebuild the published message.
    #[must_use]
    pub fn to_outbound(&self) -> OutboundMessage {
        OutboundMessage {
            properties: self.properties.clone(),
            body: self.body.clone(),
        }
    }
}

/// Publish side of the broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare the queues of a stage. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the declaration.
    async fn declare_stage(&self, stage: &str, replicas: usize, sharded: bool) -> Result<()>;

    /// Publish a message.
    ///
    /// # Errors
    ///
    /// Returns `PublishFailed` if the broker does not accept the message.
    async fn publish(&self, route: &Route, message: OutboundMessage) -> Result<()>;

    /// Start consuming a queue.
    ///
    /// # Errors
    ///
    /// Returns `ConsumeFailed` if the queue is not declared.
    async fn consume(&self, route: &Route) -> Result<Box<dyn Consumer>>;
}

/// Consume side of one queue subscription.
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivery. `None` once the broker is closed.
    ///
    /// # Errors
    ///
    /// Returns `ConsumeFailed` if the subscription breaks.
    async fn next(&mut self) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery.
    ///
    /// # Errors
    ///
    /// Returns `AckFailed` for unknown tags.
    async fn ack(&mut self, tag: DeliveryTag) -> Result<()>;

    /// Reject a delivery, optionally putting it back on the queue.
    ///
    /// # Errors
    ///
    /// Returns `AckFailed` for unknown tags.
    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()>;
}
