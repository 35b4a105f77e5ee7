//! RabbitMQ target backend
//!
//! Publishes each message to the rule's `exchange` with its `routing_key`.

use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, warn};
use url::Url;

use super::adapter::Deliver;
use super::ClientError;
use crate::config::{ClientKind, RabbitClientConfig};
use crate::message::OutboundMessage;

pub struct RabbitDeliver {
    connection: Connection,
    channel: Channel,
}

/// Connection URI with credentials applied.
///
/// `address` may omit the scheme (`host:5672`), `amqp://` is assumed then.
pub fn amqp_uri(config: &RabbitClientConfig) -> Result<String, ClientError> {
    let address = if config.address.contains("://") {
        config.address.clone()
    } else {
        format!("amqp://{}", config.address)
    };
    let mut url = Url::parse(&address)
        .map_err(|e| ClientError::InvalidConfig(format!("invalid amqp address '{}': {}", address, e)))?;

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        if !username.is_empty() && !password.is_empty() {
            url.set_username(username)
                .and_then(|_| url.set_password(Some(password)))
                .map_err(|_| {
                    ClientError::InvalidConfig(format!("cannot set credentials on '{}'", address))
                })?;
        }
    }
    Ok(url.to_string())
}

impl RabbitDeliver {
    pub async fn connect(config: RabbitClientConfig) -> Result<Self, ClientError> {
        let uri = amqp_uri(&config)?;
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| ClientError::Connection(format!("{}: {}", config.address, e)))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        Ok(Self {
            connection,
            channel,
        })
    }
}

#[async_trait]
impl Deliver for RabbitDeliver {
    fn kind(&self) -> ClientKind {
        ClientKind::RabbitMq
    }

    async fn deliver(&self, msg: OutboundMessage) -> Result<(), ClientError> {
        let exchange = msg.target.exchange.as_str();
        let routing_key = msg.target.routing_key.as_str();

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &msg.payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| ClientError::Send(e.to_string()))?
            .await
            .map_err(|e| ClientError::Send(e.to_string()))?;

        debug!(exchange, routing_key, "AMQP message published");
        Ok(())
    }

    async fn shutdown(&self) {
        if let Err(e) = self.connection.close(200, "closing").await {
            warn!("Failed to close AMQP connection: {}", e);
        }
    }
}
