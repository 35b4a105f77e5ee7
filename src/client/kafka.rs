//! Kafka target backend (cargo feature `kafka`)
//!
//! Messages are produced to the rule target's configured topic.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::debug;

use super::adapter::Deliver;
use super::ClientError;
use crate::config::{ClientKind, KafkaClientConfig};
use crate::message::OutboundMessage;

const SEND_TIMEOUT: Duration = Duration::from_secs(20);

pub struct KafkaDeliver {
    producer: FutureProducer,
}

fn sasl_mechanism(sasl_type: &str) -> Result<&'static str, ClientError> {
    match sasl_type {
        "plain" => Ok("PLAIN"),
        "scram256" => Ok("SCRAM-SHA-256"),
        "scram512" => Ok("SCRAM-SHA-512"),
        other => Err(ClientError::InvalidConfig(format!(
            "unsupported sasl type '{}'",
            other
        ))),
    }
}

/// librdkafka properties for a client entry
pub fn producer_config(
    config: &KafkaClientConfig,
    client_id: &str,
) -> Result<ClientConfig, ClientError> {
    if config.address.is_empty() {
        return Err(ClientError::InvalidConfig(
            "kafka address list is empty".to_string(),
        ));
    }

    let mut cfg = ClientConfig::new();
    cfg.set("bootstrap.servers", config.address.join(","))
        .set("client.id", client_id)
        .set("message.timeout.ms", SEND_TIMEOUT.as_millis().to_string());

    let sasl = match config.sasl_type.as_deref() {
        None | Some("") => None,
        Some(kind) => Some(sasl_mechanism(kind)?),
    };
    let tls = !config.tls.is_empty();

    let protocol = match (sasl.is_some(), tls) {
        (false, false) => "plaintext",
        (false, true) => "ssl",
        (true, false) => "sasl_plaintext",
        (true, true) => "sasl_ssl",
    };
    cfg.set("security.protocol", protocol);

    if let Some(mechanism) = sasl {
        cfg.set("sasl.mechanism", mechanism)
            .set("sasl.username", config.username.clone().unwrap_or_default())
            .set("sasl.password", config.password.clone().unwrap_or_default());
    }
    if let Some(ref ca) = config.tls.ca {
        cfg.set("ssl.ca.location", ca);
    }
    if let (Some(cert), Some(key)) = (&config.tls.cert, &config.tls.key) {
        cfg.set("ssl.certificate.location", cert)
            .set("ssl.key.location", key);
    }
    if config.tls.insecure_skip_verify {
        cfg.set("enable.ssl.certificate.verification", "false");
    }

    Ok(cfg)
}

impl KafkaDeliver {
    pub fn new(config: KafkaClientConfig, client_id: &str) -> Result<Self, ClientError> {
        let producer = producer_config(&config, client_id)?
            .create()
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl Deliver for KafkaDeliver {
    fn kind(&self) -> ClientKind {
        ClientKind::Kafka
    }

    fn accept(&self, msg: &OutboundMessage) -> Result<(), ClientError> {
        if msg.target.topic.is_empty() {
            return Err(ClientError::InvalidMessage(
                "kafka target requires a topic".to_string(),
            ));
        }
        Ok(())
    }

    async fn deliver(&self, msg: OutboundMessage) -> Result<(), ClientError> {
        let topic = msg.target.topic.as_str();
        let record = FutureRecord::<(), [u8]>::to(topic).payload(&msg.payload[..]);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(e, _)| ClientError::Send(e.to_string()))?;

        debug!(topic, partition, offset, "Kafka message produced");
        Ok(())
    }

    async fn shutdown(&self) {
        let _ = self.producer.flush(Timeout::After(Duration::from_secs(5)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Certificate;

    fn config(sasl: Option<&str>, tls: bool) -> KafkaClientConfig {
        KafkaClientConfig {
            address: vec!["k1:9092".to_string(), "k2:9092".to_string()],
            sasl_type: sasl.map(str::to_string),
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
            tls: if tls {
                Certificate {
                    ca: Some("/certs/ca.pem".to_string()),
                    ..Default::default()
                }
            } else {
                Certificate::default()
            },
        }
    }

    #[test]
    fn test_plaintext() {
        let cfg = producer_config(&config(None, false), "node-kafka").unwrap();
        assert_eq!(cfg.get("bootstrap.servers"), Some("k1:9092,k2:9092"));
        assert_eq!(cfg.get("security.protocol"), Some("plaintext"));
        assert_eq!(cfg.get("sasl.mechanism"), None);
    }

    #[test]
    fn test_scram_over_tls() {
        let cfg = producer_config(&config(Some("scram512"), true), "node-kafka").unwrap();
        assert_eq!(cfg.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(cfg.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(cfg.get("ssl.ca.location"), Some("/certs/ca.pem"));
    }

    #[test]
    fn test_unknown_sasl_type() {
        assert!(producer_config(&config(Some("kerberos"), false), "x").is_err());
    }
}
