//! In-process broker with at-least-once delivery.
//!
//! Deliveries stay unacknowledged until acked. Dropping a consumer puts its
//! unacknowledged deliveries back at the head of the queue, which is what a
//! real broker does when a worker's connection dies.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use super::{Broker, Consumer, Delivery, DeliveryTag, QueueName, Route};
use crate::envelope::{MessageProperties, OutboundMessage};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct Stored {
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    unacked: HashMap<DeliveryTag, (u64, Stored)>,
    history: Vec<OutboundMessage>,
}

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<QueueName, QueueState>,
    next_tag: DeliveryTag,
    next_consumer: u64,
    closed: bool,
    fail_publishes: bool,
}

/// Broker that keeps every queue in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

fn lock(inner: &Mutex<Inner>) -> Result<MutexGuard<'_, Inner>> {
    inner
        .lock()
        .map_err(|_| Error::consume_failed("*", "broker state poisoned"))
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop all consumers. Pending `next` calls return `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker state is poisoned.
    pub fn close(&self) -> Result<()> {
        lock(&self.inner)?.closed = true;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Make every subsequent publish fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker state is poisoned.
    pub fn fail_publishes(&self, fail: bool) -> Result<()> {
        lock(&self.inner)?.fail_publishes = fail;
        Ok(())
    }

    /// Every message ever published to `route`, in publish order.
    #[must_use]
    pub fn published(&self, route: &Route) -> Vec<OutboundMessage> {
        lock(&self.inner)
            .ok()
            .and_then(|inner| inner.queues.get(&route.queue()).map(|q| q.history.clone()))
            .unwrap_or_default()
    }

    /// Number of messages waiting on `route`.
    #[must_use]
    pub fn ready_len(&self, route: &Route) -> usize {
        lock(&self.inner)
            .ok()
            .and_then(|inner| inner.queues.get(&route.queue()).map(|q| q.ready.len()))
            .unwrap_or(0)
    }

    /// Number of delivered but unacknowledged messages on `route`.
    #[must_use]
    pub fn unacked_len(&self, route: &Route) -> usize {
        lock(&self.inner)
            .ok()
            .and_then(|inner| inner.queues.get(&route.queue()).map(|q| q.unacked.len()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_stage(&self, stage: &str, replicas: usize, sharded: bool) -> Result<()> {
        let mut inner = lock(&self.inner)?;
        if sharded {
            for replica in 0..replicas {
                inner
                    .queues
                    .entry(Route::replica(stage, replica).queue())
                    .or_default();
            }
        } else {
            inner.queues.entry(Route::shared(stage).queue()).or_default();
        }
        Ok(())
    }

    async fn publish(&self, route: &Route, message: OutboundMessage) -> Result<()> {
        let queue_name = route.queue();
        {
            let mut inner = lock(&self.inner)?;
            if inner.fail_publishes {
                return Err(Error::publish_failed(queue_name.as_str(), "broker rejected publish"));
            }
            let queue = inner
                .queues
                .get_mut(&queue_name)
                .ok_or_else(|| Error::publish_failed(queue_name.as_str(), "no such queue"))?;
            queue.history.push(message.clone());
            queue.ready.push_back(Stored {
                properties: message.properties,
                body: message.body,
                redelivered: false,
            });
        }
        debug!(queue = %queue_name, "Published message");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, route: &Route) -> Result<Box<dyn Consumer>> {
        let queue = route.queue();
        let id = {
            let mut inner = lock(&self.inner)?;
            if !inner.queues.contains_key(&queue) {
                return Err(Error::consume_failed(queue.as_str(), "no such queue"));
            }
            inner.next_consumer = inner.next_consumer.saturating_add(1);
            inner.next_consumer
        };
        Ok(Box::new(InMemoryConsumer {
            id,
            queue,
            inner: Arc::clone(&self.inner),
            notify: Arc::clone(&self.notify),
        }))
    }
}

enum Poll {
    Ready(Delivery),
    Closed,
    Empty,
}

/// Subscription to one queue of an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryConsumer {
    id: u64,
    queue: QueueName,
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl InMemoryConsumer {
    fn poll(&self) -> Result<Poll> {
        let mut inner = lock(&self.inner)?;
        if inner.closed {
            return Ok(Poll::Closed);
        }
        inner.next_tag = inner.next_tag.saturating_add(1);
        let tag = inner.next_tag;
        let queue = inner
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| Error::consume_failed(self.queue.as_str(), "queue deleted"))?;
        let Some(stored) = queue.ready.pop_front() else {
            return Ok(Poll::Empty);
        };
        let delivery = Delivery {
            tag,
            properties: stored.properties.clone(),
            body: stored.body.clone(),
            redelivered: stored.redelivered,
        };
        queue.unacked.insert(tag, (self.id, stored));
        Ok(Poll::Ready(delivery))
    }

    fn settle(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        {
            let mut inner = lock(&self.inner)?;
            let queue = inner
                .queues
                .get_mut(&self.queue)
                .ok_or_else(|| Error::consume_failed(self.queue.as_str(), "queue deleted"))?;
            match queue.unacked.remove(&tag) {
                Some((owner, mut stored)) if owner == self.id => {
                    if requeue {
                        stored.redelivered = true;
                        queue.ready.push_back(stored);
                    }
                }
                Some(entry) => {
                    queue.unacked.insert(tag, entry);
                    return Err(Error::AckFailed {
                        tag,
                        reason: "delivery belongs to another consumer".to_string(),
                    });
                }
                None => {
                    return Err(Error::AckFailed {
                        tag,
                        reason: "unknown delivery tag".to_string(),
                    });
                }
            }
        }
        if requeue {
            self.notify.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.poll()? {
                Poll::Ready(delivery) => return Ok(Some(delivery)),
                Poll::Closed => return Ok(None),
                Poll::Empty => notified.await,
            }
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        self.settle(tag, false)
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.settle(tag, requeue)
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let Some(queue) = inner.queues.get_mut(&self.queue) else {
            return;
        };
        let mut orphaned: Vec<(DeliveryTag, Stored)> = Vec::new();
        queue.unacked.retain(|tag, (owner, stored)| {
            if *owner == self.id {
                orphaned.push((*tag, stored.clone()));
                false
            } else {
                true
            }
        });
        orphaned.sort_by_key(|(tag, _)| *tag);
        for (_, mut stored) in orphaned.into_iter().rev() {
            stored.redelivered = true;
            queue.ready.push_front(stored);
        }
        drop(inner);
        self.notify.notify_waiters();
    }
}
