//! Message types exchanged between the routing engine and its backends.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::ClientRef;

/// Delivery guarantee level supported by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// Fire and forget
    #[default]
    AtMostOnce = 0,
    /// Acknowledged delivery
    AtLeastOnce = 1,
}

impl QoS {
    /// Whether a message of this level must be acknowledged to its sender
    pub fn requires_ack(self) -> bool {
        self == QoS::AtLeastOnce
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(format!("unsupported qos {} (expected 0 or 1)", other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        qos as u8
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Reference to an inbound message that still has to be acknowledged.
///
/// Packet identifiers are scoped per connection, so the reference carries the
/// name of the client the message arrived on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckRef {
    /// Name of the client that received the message
    pub client: Arc<str>,
    /// Connection-local packet identifier
    pub packet_id: u16,
}

impl AckRef {
    pub fn new(client: impl Into<Arc<str>>, packet_id: u16) -> Self {
        Self {
            client: client.into(),
            packet_id,
        }
    }
}

impl fmt::Display for AckRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.client, self.packet_id)
    }
}

/// A message received on a source connection
#[derive(Debug, Clone)]
pub struct InboundPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Packet identifier (0 for QoS 0)
    pub packet_id: u16,
}

impl InboundPublish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
            dup: false,
            packet_id: 0,
        }
    }

    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        self.packet_id = packet_id;
        self
    }
}

/// A message submitted to a target backend
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Rewritten topic (MQTT, Kafka) or path (HTTP)
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Target binding of the rule, for protocol-specific addressing
    pub target: ClientRef,
    /// Source message to acknowledge once the target confirms delivery
    pub origin: Option<AckRef>,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, target: ClientRef) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            target,
            origin: None,
        }
    }
}
