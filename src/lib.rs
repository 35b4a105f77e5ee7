//! vibe-rule - edge message routing bridge
//!
//! Receives messages from MQTT brokers or an HTTP ingress, optionally passes
//! them through a function service, and forwards the result to MQTT, HTTP,
//! message queue or object store targets while keeping QoS 1
//! acknowledgments meaningful across the hop.

pub mod client;
pub mod config;
pub mod function;
pub mod message;
pub mod metrics;
pub mod rule;
pub mod topic;

pub use client::{Client, ClientError, ClientEvent, ClientFactory, DefaultClientFactory};
pub use config::Config;
pub use function::{FunctionCaller, FunctionError, HttpFunctionClient};
pub use message::{AckRef, InboundPublish, OutboundMessage, QoS};
pub use metrics::{Metrics, MetricsServer};
pub use rule::{Builder, ClientSet, RuleError};
pub use topic::Matcher;
