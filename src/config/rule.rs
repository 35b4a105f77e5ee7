//! Rule Configuration
//!
//! A rule binds one source endpoint/topic to at most one target endpoint,
//! with an optional transform function in between.

use serde::{Deserialize, Serialize};

use crate::message::QoS;

/// Routing rule
#[derive(Debug, Clone, Deserialize)]
pub struct RuleInfo {
    /// Unique rule name (also the ingress URL parameter)
    pub name: String,
    /// Where messages come from
    pub source: ClientRef,
    /// Where transformed messages go (absent = filter/sink rule)
    #[serde(default)]
    pub target: Option<ClientRef>,
    /// Function applied to the payload before forwarding
    #[serde(default)]
    pub function: Option<FunctionInfo>,
    /// When the source message is acknowledged
    #[serde(default)]
    pub ack: AckMode,
}

impl RuleInfo {
    pub fn new(name: impl Into<String>, source: ClientRef) -> Self {
        Self {
            name: name.into(),
            source,
            target: None,
            function: None,
            ack: AckMode::default(),
        }
    }

    pub fn with_target(mut self, target: ClientRef) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_function(mut self, name: impl Into<String>) -> Self {
        self.function = Some(FunctionInfo { name: name.into() });
        self
    }

    pub fn with_ack(mut self, ack: AckMode) -> Self {
        self.ack = ack;
        self
    }

    /// Subscription QoS for the source topic.
    ///
    /// Degraded to the target's QoS so the bridge never requests a guarantee
    /// it cannot honor downstream.
    pub fn effective_qos(&self) -> QoS {
        match &self.target {
            Some(target) => self.source.qos.min(target.qos),
            None => self.source.qos,
        }
    }
}

/// Endpoint binding of a rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRef {
    /// Client name; empty means the configured default client
    #[serde(default)]
    pub client: String,
    /// Topic pattern (source) or template (target)
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub qos: QoS,
    /// HTTP path, replaces `topic` when set
    #[serde(default)]
    pub path: String,
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,
    /// AMQP exchange
    #[serde(default)]
    pub exchange: String,
    /// AMQP routing key
    #[serde(default)]
    pub routing_key: String,
}

fn default_method() -> String {
    "POST".to_string()
}

impl ClientRef {
    pub fn new(client: impl Into<String>, topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            client: client.into(),
            topic: topic.into(),
            qos,
            method: default_method(),
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self.routing_key = routing_key.into();
        self
    }
}

/// Function invoked on the payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
}

/// Acknowledgment policy for QoS 1 source messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Acknowledge once the message was handed to the target (or filtered)
    #[default]
    Forwarded,
    /// Acknowledge when the MQTT target acknowledges the forwarded publish
    Delivered,
}
