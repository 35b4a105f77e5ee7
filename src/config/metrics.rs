//! Metrics configuration

use serde::Deserialize;
use std::net::SocketAddr;

/// Prometheus endpoint settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `/metrics` over HTTP
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}
