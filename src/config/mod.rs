//! Configuration Module
//!
//! Provides TOML-based configuration for the rule engine:
//! - Node identity and default client
//! - Named clients (`[[clients]]`) and routing rules (`[[rules]]`)
//! - Function invocation and submission queue settings
//! - Environment variable overrides (VIBE_RULE__* prefix)

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use client::{
    Certificate, ClientInfo, ClientKind, HttpClientConfig, HttpServerConfig, KafkaClientConfig,
    MqttClientConfig, RabbitClientConfig, S3ClientConfig,
};
pub use metrics::MetricsConfig;
pub use rule::{AckMode, ClientRef, FunctionInfo, RuleInfo};

mod client;
mod metrics;
mod rule;

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Node identity
    pub node: NodeConfig,
    /// Defaults applied to rules
    pub defaults: DefaultsConfig,
    /// System broker, added as an MQTT client named `defaults.client`
    pub broker: Option<BrokerConfig>,
    /// Function invocation endpoint
    pub function: FunctionConfig,
    /// Submission queue of asynchronous backends
    pub adapter: AdapterConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
    /// Named endpoints
    pub clients: Vec<ClientInfo>,
    /// Routing rules
    pub rules: Vec<RuleInfo>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Node identity
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Prefix of every MQTT client identifier
    pub name: String,
}

fn default_node_name() -> String {
    "vibe-rule".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Client used by rule endpoints that name none
    pub client: String,
}

fn default_client() -> String {
    "baetyl-broker".to_string()
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            client: default_client(),
        }
    }
}

/// System broker connection
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(flatten)]
    pub tls: Certificate,
}

impl BrokerConfig {
    /// Client entry for the broker
    fn to_client(&self, name: &str) -> ClientInfo {
        let mut info = ClientInfo::new(name, ClientKind::Mqtt).with("address", self.address.as_str());
        if let Some(ref username) = self.username {
            info = info.with("username", username.as_str());
        }
        if let Some(ref password) = self.password {
            info = info.with("password", password.as_str());
        }
        if let Ok(serde_json::Value::Object(tls)) = serde_json::to_value(&self.tls) {
            for (key, value) in tls {
                if !value.is_null() {
                    info.value.insert(key, value);
                }
            }
        }
        info
    }
}

/// Function invocation endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FunctionConfig {
    /// Base URL; functions are invoked with `POST {address}/{name}`
    pub address: Option<String>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            address: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Behavior of `send_or_drop` when the submission queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Wait for free capacity
    #[default]
    Block,
    /// Wait up to `submit_timeout`, then fail
    Timeout,
    /// Fail immediately
    Drop,
}

/// Submission queue settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Queue capacity per backend
    pub capacity: usize,
    pub submit: SubmitMode,
    #[serde(with = "humantime_serde")]
    pub submit_timeout: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            submit: SubmitMode::Block,
            submit_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `VIBE_RULE__` prefix with double underscores for nesting:
    ///    - `VIBE_RULE__NODE__NAME=edge-1` overrides `node.name`
    ///    - `VIBE_RULE__ADAPTER__CAPACITY=4096` overrides `adapter.capacity`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("node.name", "vibe-rule")?
            .set_default("defaults.client", "baetyl-broker")?
            .set_default("function.timeout", "30s")?
            .set_default("adapter.capacity", 1024)?
            .set_default("adapter.submit", "block")?
            .set_default("adapter.submit_timeout", "5s")?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.bind", "0.0.0.0:9090")?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // No file, defaults and environment only
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("VIBE_RULE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = cfg.try_deserialize()?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Resolve defaults that depend on other sections.
    ///
    /// Empty rule endpoints are bound to `defaults.client`, and the `[broker]`
    /// section becomes an MQTT client of that name unless one already exists.
    pub fn normalize(&mut self) {
        let default_client = self.defaults.client.clone();

        for rule in &mut self.rules {
            if rule.source.client.is_empty() {
                rule.source.client = default_client.clone();
            }
            if let Some(ref mut target) = rule.target {
                if target.client.is_empty() {
                    target.client = default_client.clone();
                }
            }
        }

        if let Some(ref broker) = self.broker {
            if !self.clients.iter().any(|c| c.name == default_client) {
                self.clients.push(broker.to_client(&default_client));
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.name.is_empty() {
            return Err(ConfigError::Validation(
                "node.name cannot be empty".to_string(),
            ));
        }

        if self.adapter.capacity == 0 {
            return Err(ConfigError::Validation(
                "adapter.capacity must be greater than 0".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for client in &self.clients {
            if client.name.is_empty() {
                return Err(ConfigError::Validation(
                    "client name cannot be empty".to_string(),
                ));
            }
            if !names.insert(client.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate client name '{}'",
                    client.name
                )));
            }
        }

        let mut names = HashSet::new();
        for rule in &self.rules {
            if rule.name.is_empty() {
                return Err(ConfigError::Validation(
                    "rule name cannot be empty".to_string(),
                ));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
        }

        Ok(())
    }
}
