//! Backend Clients
//!
//! Every configured endpoint is reached through the [`Client`] trait. The
//! builder selects the implementation from the client's `kind` through a
//! [`ClientFactory`]; routing code only ever talks to `dyn Client`.
//!
//! MQTT is the only backend with a native asynchronous pipeline. HTTP
//! targets, message queues and the object store are wrapped by the
//! [`AsyncSendAdapter`](adapter::AsyncSendAdapter), which gives them a
//! bounded submission queue and concurrent delivery.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{AdapterConfig, ClientInfo, ClientKind};
use crate::message::{AckRef, InboundPublish, OutboundMessage, QoS};

pub mod adapter;
pub mod http;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod mqtt;
pub mod rabbit;
pub mod s3;
pub mod tls;

pub use adapter::{AsyncSendAdapter, Deliver};

/// Error type for backend operations
#[derive(Debug)]
pub enum ClientError {
    /// Client was closed
    Closed,
    /// `start` called twice
    AlreadyStarted,
    /// Submission queue is full (drop mode)
    QueueFull,
    /// Submission or delivery timed out
    Timeout,
    /// Message rejected before delivery
    InvalidMessage(String),
    /// Invalid configuration
    InvalidConfig(String),
    /// Connection to the backend failed or was lost
    Connection(String),
    /// Backend refused or failed the delivery
    Send(String),
    /// TLS setup failed
    Tls(tls::TlsError),
    /// Other error
    Other(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Closed => write!(f, "Client closed"),
            ClientError::AlreadyStarted => write!(f, "Client already started"),
            ClientError::QueueFull => write!(f, "Submission queue full"),
            ClientError::Timeout => write!(f, "Operation timed out"),
            ClientError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            ClientError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            ClientError::Connection(msg) => write!(f, "Connection error: {}", msg),
            ClientError::Send(msg) => write!(f, "Send failed: {}", msg),
            ClientError::Tls(e) => write!(f, "TLS error: {}", e),
            ClientError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Tls(e) => Some(e),
            _ => None,
        }
    }
}

impl From<tls::TlsError> for ClientError {
    fn from(e: tls::TlsError) -> Self {
        ClientError::Tls(e)
    }
}

impl From<crate::config::ConfigError> for ClientError {
    fn from(e: crate::config::ConfigError) -> Self {
        ClientError::InvalidConfig(e.to_string())
    }
}

/// Event delivered by a started client, in connection order
#[derive(Debug)]
pub enum ClientEvent {
    /// Message received on a subscribed topic
    Publish(InboundPublish),
    /// The backend confirmed a forwarded message; carries the source
    /// message that was waiting for it
    Ack(AckRef),
    /// Connectivity problem, the client keeps reconnecting on its own
    Error(ClientError),
}

/// Sending half of a client's event channel
pub type EventSender = mpsc::Sender<ClientEvent>;

/// A topic the client subscribes to on (re)connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// Contract implemented by every backend
#[async_trait]
pub trait Client: Send + Sync {
    /// Configured client name
    fn name(&self) -> &str;

    fn kind(&self) -> ClientKind;

    /// Submit a message for delivery.
    ///
    /// Whether a full queue blocks, times out or fails immediately is set by
    /// `[adapter] submit`. Fails with [`ClientError::Closed`] once the client
    /// is closed, including for callers blocked at that moment.
    async fn send_or_drop(&self, msg: OutboundMessage) -> Result<(), ClientError>;

    /// Acknowledge an inbound message received by this client
    async fn send_ack(&self, _ack: &AckRef) -> Result<(), ClientError> {
        Ok(())
    }

    /// Begin delivering events to `events` (`None` for pure targets).
    /// A second call fails with [`ClientError::AlreadyStarted`].
    async fn start(&self, events: Option<EventSender>) -> Result<(), ClientError>;

    /// Stop the client; safe to call more than once
    async fn close(&self) -> Result<(), ClientError>;
}

/// Construction parameters computed by the builder
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Identifier presented to the backend
    pub client_id: String,
    /// Aggregated subscriptions of all rules sourced on this client
    pub subscriptions: Vec<Subscription>,
    pub adapter: AdapterConfig,
}

impl ClientOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            subscriptions: Vec::new(),
            adapter: AdapterConfig::default(),
        }
    }
}

/// Produces backends from configuration entries
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(
        &self,
        info: &ClientInfo,
        options: ClientOptions,
    ) -> Result<Arc<dyn Client>, ClientError>;

    /// Whether `kind` can be produced
    fn supports(&self, kind: &ClientKind) -> bool;
}

/// Factory for the built-in backends
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClientFactory;

#[async_trait]
impl ClientFactory for DefaultClientFactory {
    async fn create(
        &self,
        info: &ClientInfo,
        options: ClientOptions,
    ) -> Result<Arc<dyn Client>, ClientError> {
        match &info.kind {
            ClientKind::Mqtt => Ok(Arc::new(mqtt::MqttClient::new(
                &info.name,
                info.parse()?,
                options,
            )?)),
            ClientKind::Http => {
                let deliver = http::HttpDeliver::new(info.parse()?)?;
                Ok(Arc::new(AsyncSendAdapter::new(
                    &info.name,
                    deliver,
                    &options.adapter,
                )))
            }
            ClientKind::RabbitMq => {
                let deliver = rabbit::RabbitDeliver::connect(info.parse()?).await?;
                Ok(Arc::new(AsyncSendAdapter::new(
                    &info.name,
                    deliver,
                    &options.adapter,
                )))
            }
            #[cfg(feature = "kafka")]
            ClientKind::Kafka => {
                let deliver = kafka::KafkaDeliver::new(info.parse()?, &options.client_id)?;
                Ok(Arc::new(AsyncSendAdapter::new(
                    &info.name,
                    deliver,
                    &options.adapter,
                )))
            }
            ClientKind::S3 => {
                let deliver = s3::S3Deliver::new(info.parse()?)?;
                Ok(Arc::new(AsyncSendAdapter::new(
                    &info.name,
                    deliver,
                    &options.adapter,
                )))
            }
            other => Err(ClientError::InvalidConfig(format!(
                "client kind ({}) is not supported",
                other
            ))),
        }
    }

    fn supports(&self, kind: &ClientKind) -> bool {
        match kind {
            ClientKind::Mqtt | ClientKind::Http | ClientKind::RabbitMq | ClientKind::S3 => true,
            ClientKind::Kafka => cfg!(feature = "kafka"),
            ClientKind::HttpServer | ClientKind::Other(_) => false,
        }
    }
}
