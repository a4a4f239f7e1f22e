//! Message envelopes exchanged between stage replicas.

use serde::{Deserialize, Serialize};

use crate::{CorrelationId, WorkerId};

/// How a data message picks its target replica.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ShardKey {
    /// Destination is unsharded; any replica may take the message.
    #[default]
    Unsharded,
    /// Route by the hash of this key.
    Key(String),
    /// Route by the hash of the payload bytes.
    ContentHash,
    /// Route to an index computed by the caller; it must be below the replica count.
    Replica(usize),
}

impl ShardKey {
    /// Route by `key`.
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }
}

/// Done-marker payload: who is done, and which replica it was addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneMarker {
    /// Stage instance that will send no more data for the stream
    pub sender: WorkerId,
    /// Replica index of the receiving stage this marker is meant for
    pub target_replica: usize,
}

/// Envelope subtype.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// Opaque payload for the stage callback.
    Data,
    /// End of a sender's output for a stream.
    Done(DoneMarker),
}

/// Per-message metadata carried alongside the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// Stream the message belongs to
    pub correlation_id: CorrelationId,
    /// Data or done-marker
    pub kind: MessageKind,
}

/// A message ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Metadata
    pub properties: MessageProperties,
    /// Raw body; empty for done-markers
    pub body: Vec<u8>,
}

impl OutboundMessage {
    /// Build a data message.
    #[must_use]
    pub const fn data(correlation_id: CorrelationId, body: Vec<u8>) -> Self {
        Self {
            properties: MessageProperties {
                correlation_id,
                kind: MessageKind::Data,
            },
            body,
        }
    }

    /// Build a done-marker addressed to `target_replica`.
    #[must_use]
    pub const fn done(correlation_id: CorrelationId, sender: WorkerId, target_replica: usize) -> Self {
        Self {
            properties: MessageProperties {
                correlation_id,
                kind: MessageKind::Done(DoneMarker {
                    sender,
                    target_replica,
                }),
            },
            body: Vec::new(),
        }
    }

    /// Whether this is a done-marker.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self.properties.kind, MessageKind::Done(_))
    }
}

/// Item handed to a stage callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A payload accepted for the stream.
    Data {
        /// Stream id
        correlation_id: CorrelationId,
        /// Payload bytes
        payload: Vec<u8>,
    },
    /// Every upstream replica is done with the stream.
    End {
        /// Stream id
        correlation_id: CorrelationId,
    },
}

impl StreamEvent {
    /// Stream this event belongs to.
    #[must_use]
    pub const fn correlation_id(&self) -> &CorrelationId {
        match self {
            Self::Data { correlation_id, .. } | Self::End { correlation_id } => correlation_id,
        }
    }

    /// Payload bytes, if this is a data event.
    #[must_use]
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::Data { payload, .. } => Some(payload),
            Self::End { .. } => None,
        }
    }

    /// Whether this is the end-of-stream signal.
    #[must_use]
    pub const fn is_end(&self) -> bool {
        matches!(self, Self::End { .. })
    }
}
