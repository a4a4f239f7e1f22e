//! RabbitMQ broker over AMQP 0-9-1.
//!
//! - Shared queues are published through the default exchange, with the queue
//!   name as routing key.
//! - Each sharded stage gets a durable direct exchange named after the stage.
//!   Replica queue `stage.<i>` is bound to it with routing key `<i>`.
//!
//! Data and done-markers are told apart by the AMQP `type` property. A
//! done-marker carries its [`DoneMarker`] as a JSON body.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};

use super::{Broker, Consumer, Delivery, DeliveryTag, Route};
use crate::envelope::{DoneMarker, MessageKind, MessageProperties, OutboundMessage};
use crate::{CorrelationId, Error, Result};

const KIND_DATA: &str = "data";
const KIND_DONE: &str = "done";
const PERSISTENT: u8 = 2;

/// Exchange and routing key a route is published to.
fn publish_target(route: &Route) -> (String, String) {
    match route {
        Route::Shared { stage } => (String::new(), stage.clone()),
        Route::Replica { stage, replica } => (stage.clone(), replica.to_string()),
    }
}

/// AMQP properties and body of an outbound message.
fn encode(message: &OutboundMessage) -> Result<(BasicProperties, Vec<u8>)> {
    let properties = BasicProperties::default()
        .with_correlation_id(ShortString::from(
            message.properties.correlation_id.as_str().to_string(),
        ))
        .with_delivery_mode(PERSISTENT);
    match &message.properties.kind {
        MessageKind::Data => Ok((
            properties.with_kind(ShortString::from(KIND_DATA.to_string())),
            message.body.clone(),
        )),
        MessageKind::Done(marker) => {
            let body = serde_json::to_vec(marker).map_err(|e| Error::serialization(e.to_string()))?;
            Ok((properties.with_kind(ShortString::from(KIND_DONE.to_string())), body))
        }
    }
}

/// Envelope properties and payload of a received message.
fn decode(properties: &BasicProperties, body: Vec<u8>) -> Result<(MessageProperties, Vec<u8>)> {
    let correlation_id = properties
        .correlation_id()
        .as_ref()
        .map(|cid| CorrelationId::new(cid.as_str()))
        .ok_or_else(|| Error::serialization("message without correlation id"))?;

    match properties.kind().as_ref().map(ShortString::as_str) {
        Some(KIND_DONE) => {
            let marker: DoneMarker = serde_json::from_slice(&body)
                .map_err(|e| Error::serialization(format!("corrupt done-marker: {e}")))?;
            Ok((
                MessageProperties {
                    correlation_id,
                    kind: MessageKind::Done(marker),
                },
                Vec::new(),
            ))
        }
        Some(KIND_DATA) | None => Ok((
            MessageProperties {
                correlation_id,
                kind: MessageKind::Data,
            },
            body,
        )),
        Some(other) => Err(Error::serialization(format!("unknown message type '{other}'"))),
    }
}

/// Connection to a RabbitMQ broker.
pub struct AmqpBroker {
    address: String,
    connection: Connection,
    channel: Channel,
    prefetch: u16,
}

impl std::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("address", &self.address)
            .field("prefetch", &self.prefetch)
            .finish_non_exhaustive()
    }
}

impl AmqpBroker {
    /// Open a connection and a publishing channel.
    ///
    /// # Errors
    ///
    /// Returns `BrokerUnavailable` (transient) if the broker cannot be reached,
    /// so callers can wrap this in [`connect_with_retry`](super::connect_with_retry).
    pub async fn connect(address: &str) -> Result<Self> {
        let connection = Connection::connect(address, ConnectionProperties::default())
            .await
            .map_err(|e| Error::broker_unavailable(address, e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::broker_unavailable(address, e.to_string()))?;
        channel
            .confirm_select(lapin::options::ConfirmSelectOptions::default())
            .await
            .map_err(|e| Error::broker_unavailable(address, e.to_string()))?;
        Ok(Self {
            address: address.to_string(),
            connection,
            channel,
            prefetch: 1,
        })
    }

    /// Deliveries a consumer may hold unacknowledged.
    #[must_use]
    pub const fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| Error::consume_failed(queue, e.to_string()))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_stage(&self, stage: &str, replicas: usize, sharded: bool) -> Result<()> {
        if !sharded {
            return self.declare_queue(Route::shared(stage).queue().as_str()).await;
        }

        self.channel
            .exchange_declare(
                stage,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::consume_failed(stage, e.to_string()))?;
        for replica in 0..replicas {
            let queue = Route::replica(stage, replica).queue();
            self.declare_queue(queue.as_str()).await?;
            self.channel
                .queue_bind(
                    queue.as_str(),
                    stage,
                    &replica.to_string(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| Error::consume_failed(queue.as_str(), e.to_string()))?;
        }
        debug!(stage, replicas, "Declared sharded stage");
        Ok(())
    }

    async fn publish(&self, route: &Route, message: OutboundMessage) -> Result<()> {
        let queue = route.queue();
        let (exchange, routing_key) = publish_target(route);
        let (properties, body) = encode(&message)?;
        let confirm = self
            .channel
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|e| Error::publish_failed(queue.as_str(), e.to_string()))?;
        let confirmation = confirm
            .await
            .map_err(|e| Error::publish_failed(queue.as_str(), e.to_string()))?;
        if confirmation.is_nack() {
            return Err(Error::publish_failed(queue.as_str(), "broker nacked the publish"));
        }
        Ok(())
    }

    async fn consume(&self, route: &Route) -> Result<Box<dyn Consumer>> {
        let queue = route.queue();
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| Error::consume_failed(queue.as_str(), e.to_string()))?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| Error::consume_failed(queue.as_str(), e.to_string()))?;
        let consumer = channel
            .basic_consume(
                queue.as_str(),
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::consume_failed(queue.as_str(), e.to_string()))?;
        info!(queue = %queue, prefetch = self.prefetch, "Consuming");
        Ok(Box::new(AmqpConsumer {
            queue: queue.as_str().to_string(),
            channel,
            consumer,
        }))
    }
}

/// Subscription to one RabbitMQ queue on its own channel.
pub struct AmqpConsumer {
    queue: String,
    channel: Channel,
    consumer: lapin::Consumer,
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        let Some(delivery) = self.consumer.next().await else {
            return Ok(None);
        };
        let delivery = delivery.map_err(|e| Error::consume_failed(self.queue.as_str(), e.to_string()))?;
        let (properties, body) = decode(&delivery.properties, delivery.data)?;
        Ok(Some(Delivery {
            tag: delivery.delivery_tag,
            properties,
            body,
            redelivered: delivery.redelivered,
        }))
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| Error::AckFailed {
                tag,
                reason: e.to_string(),
            })
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| Error::AckFailed {
                tag,
                reason: e.to_string(),
            })
    }
}
