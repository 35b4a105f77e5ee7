//! Client (endpoint) configuration
//!
//! Every `[[clients]]` entry carries a `name`, a `kind` and a set of
//! kind-specific keys. The kind-specific part is kept as a raw JSON map and
//! decoded by the backend that owns it, so adding a backend never touches the
//! root config type.

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Backend kind of a client entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum ClientKind {
    Mqtt,
    Http,
    HttpServer,
    RabbitMq,
    Kafka,
    S3,
    /// Unrecognized kind, rejected when the client set is built
    Other(String),
}

impl From<String> for ClientKind {
    fn from(kind: String) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "mqtt" => ClientKind::Mqtt,
            "http" => ClientKind::Http,
            "http-server" => ClientKind::HttpServer,
            "rabbit-mq" => ClientKind::RabbitMq,
            "kafka" => ClientKind::Kafka,
            "s3" => ClientKind::S3,
            _ => ClientKind::Other(kind),
        }
    }
}

impl From<&str> for ClientKind {
    fn from(kind: &str) -> Self {
        ClientKind::from(kind.to_string())
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientKind::Mqtt => "mqtt",
            ClientKind::Http => "http",
            ClientKind::HttpServer => "http-server",
            ClientKind::RabbitMq => "rabbit-mq",
            ClientKind::Kafka => "kafka",
            ClientKind::S3 => "s3",
            ClientKind::Other(kind) => kind,
        };
        f.write_str(s)
    }
}

/// Named endpoint definition
#[derive(Debug, Clone, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub kind: ClientKind,
    /// Kind-specific settings
    #[serde(flatten)]
    pub value: serde_json::Map<String, serde_json::Value>,
}

impl ClientInfo {
    pub fn new(name: impl Into<String>, kind: impl Into<ClientKind>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            value: serde_json::Map::new(),
        }
    }

    /// Add a kind-specific setting
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.value.insert(key.to_string(), value.into());
        self
    }

    /// Decode the kind-specific settings
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(serde_json::Value::Object(self.value.clone())).map_err(|e| {
            ConfigError::Validation(format!(
                "client '{}' ({}): invalid settings: {}",
                self.name, self.kind, e
            ))
        })
    }
}

/// PEM file locations for an outbound TLS connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Certificate {
    /// CA certificate used to verify the peer
    pub ca: Option<String>,
    /// Client certificate (mutual TLS)
    pub cert: Option<String>,
    /// Client private key (mutual TLS)
    pub key: Option<String>,
    pub insecure_skip_verify: bool,
}

impl Certificate {
    pub fn is_empty(&self) -> bool {
        self.ca.is_none() && self.cert.is_none() && self.key.is_none()
    }
}

/// `kind = "mqtt"`
#[derive(Debug, Clone, Deserialize)]
pub struct MqttClientConfig {
    /// Broker URL: `tcp://host:port`, `ssl://host:port` or `mqtt(s)://...`
    pub address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keepalive", with = "humantime_serde")]
    pub keepalive: Duration,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_max_inflight")]
    pub max_inflight: u16,
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,
    #[serde(default = "default_max_reconnect_interval", with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
    /// Capacity of the rumqttc request channel
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
    /// Undelivered events held for the dispatcher before QoS 0 publishes
    /// are dropped
    #[serde(default = "default_event_backlog")]
    pub event_backlog: usize,
    #[serde(flatten)]
    pub tls: Certificate,
}

fn default_keepalive() -> Duration {
    Duration::from_secs(30)
}
fn default_true() -> bool {
    true
}
fn default_max_inflight() -> u16 {
    100
}
fn default_reconnect_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_max_reconnect_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_inbound_capacity() -> usize {
    1024
}
fn default_event_backlog() -> usize {
    16 * 1024
}

/// `kind = "http"`
#[derive(Debug, Clone, Deserialize)]
pub struct HttpClientConfig {
    /// Base URL, the rewritten topic or path is appended to it
    pub address: String,
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(flatten)]
    pub tls: Certificate,
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

/// `kind = "http-server"`
#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Server certificate; `ca` enables client verification
    #[serde(flatten)]
    pub tls: Certificate,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// `kind = "rabbit-mq"`
#[derive(Debug, Clone, Deserialize)]
pub struct RabbitClientConfig {
    /// AMQP URI, e.g. `amqp://host:5672/%2f`
    pub address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// `kind = "kafka"`
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaClientConfig {
    /// Bootstrap brokers
    pub address: Vec<String>,
    /// `plain`, `scram256` or `scram512`
    #[serde(default)]
    pub sasl_type: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(flatten)]
    pub tls: Certificate,
}

/// `kind = "s3"`
#[derive(Debug, Clone, Deserialize)]
pub struct S3ClientConfig {
    /// Object store endpoint
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub ak: Option<String>,
    #[serde(default)]
    pub sk: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    /// Credential service; when set, static credentials are ignored
    #[serde(default)]
    pub sts_address: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_parsing() {
        assert_eq!(ClientKind::from("mqtt"), ClientKind::Mqtt);
        assert_eq!(ClientKind::from("HTTP-Server"), ClientKind::HttpServer);
        assert_eq!(ClientKind::from("rabbit-mq"), ClientKind::RabbitMq);
        assert_eq!(
            ClientKind::from("zeromq"),
            ClientKind::Other("zeromq".to_string())
        );
        assert_eq!(ClientKind::HttpServer.to_string(), "http-server");
    }

    #[test]
    fn test_parse_mqtt_defaults() {
        let info = ClientInfo::new("broker", "mqtt").with("address", "tcp://127.0.0.1:1883");
        let cfg: MqttClientConfig = info.parse().unwrap();

        assert_eq!(cfg.address, "tcp://127.0.0.1:1883");
        assert_eq!(cfg.keepalive, Duration::from_secs(30));
        assert!(cfg.clean_session);
        assert_eq!(cfg.max_inflight, 100);
        assert!(cfg.tls.is_empty());
    }

    #[test]
    fn test_parse_durations_and_tls() {
        let info = ClientInfo::new("web", "http")
            .with("address", "https://example.com")
            .with("timeout", "5s")
            .with("ca", "/etc/ca.pem")
            .with("insecure_skip_verify", json!(true));
        let cfg: HttpClientConfig = info.parse().unwrap();

        assert_eq!(cfg.timeout, Duration::from_secs(5));
        assert_eq!(cfg.tls.ca.as_deref(), Some("/etc/ca.pem"));
        assert!(cfg.tls.insecure_skip_verify);
    }

    #[test]
    fn test_parse_missing_required() {
        let info = ClientInfo::new("ingress", "http-server");
        let err = info.parse::<HttpServerConfig>().unwrap_err();
        assert!(err.to_string().contains("ingress"));
    }
}
