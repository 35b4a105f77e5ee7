//! Rule Routing Engine
//!
//! Rules bind a source client and topic pattern to an optional target, with
//! an optional function in between. The [`Builder`] turns configuration into
//! a started [`ClientSet`]; from then on each inbound message flows
//!
//! ```text
//! source client -> dispatcher -> matcher -> pipeline (function, rewrite) -> target client
//!       ^                                                                       |
//!       +---------------------- acknowledgment ---------------------------------+
//! ```

use std::fmt;

use crate::client::ClientError;
use crate::config::ClientKind;

pub mod builder;
pub mod client_set;
pub mod dispatch;
pub mod pipeline;
pub mod rewrite;
pub mod server;


pub use builder::{plan, Builder, ClientPlan, IngressPlan, Plan};
pub use client_set::{ClientSet, SingleClient};
pub use dispatch::{AckDecision, Dispatcher};
pub use pipeline::{Outcome, Pipeline};
pub use rewrite::rewrite;
pub use server::{IngressError, IngressServer};

/// Error type for building and starting the rule engine
#[derive(Debug)]
pub enum RuleError {
    /// A rule references a client that is not configured
    UnknownClient { rule: String, client: String },
    /// More than one `http-server` client
    DuplicateIngress { first: String, second: String },
    /// Two clients or two rules share a name
    DuplicateName(String),
    /// No backend implementation for the kind
    UnsupportedClientKind { client: String, kind: ClientKind },
    /// Rule source cannot deliver messages (not mqtt or http-server)
    InvalidSource { rule: String, client: String },
    /// Rule target cannot accept messages (http-server)
    InvalidTarget { rule: String, client: String },
    /// Invalid source pattern or target topic
    InvalidTopic {
        rule: String,
        topic: String,
        reason: String,
    },
    /// Backend construction or start failed
    Client { client: String, source: ClientError },
    /// Ingress listener could not be bound
    Ingress {
        server: String,
        source: std::io::Error,
    },
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleError::UnknownClient { rule, client } => {
                write!(f, "client ({}) not found in rule ({})", client, rule)
            }
            RuleError::DuplicateIngress { first, second } => write!(
                f,
                "only one http-server client is allowed, found ({}) and ({})",
                first, second
            ),
            RuleError::DuplicateName(name) => write!(f, "duplicate name ({})", name),
            RuleError::UnsupportedClientKind { client, kind } => {
                write!(f, "client kind ({}) of client ({}) is not supported", kind, client)
            }
            RuleError::InvalidSource { rule, client } => write!(
                f,
                "client ({}) cannot be the source of rule ({})",
                client, rule
            ),
            RuleError::InvalidTarget { rule, client } => write!(
                f,
                "client ({}) cannot be the target of rule ({})",
                client, rule
            ),
            RuleError::InvalidTopic {
                rule,
                topic,
                reason,
            } => write!(f, "invalid topic ({}) in rule ({}): {}", topic, rule, reason),
            RuleError::Client { client, source } => {
                write!(f, "client ({}): {}", client, source)
            }
            RuleError::Ingress { server, source } => {
                write!(f, "http server ({}): {}", server, source)
            }
        }
    }
}

impl std::error::Error for RuleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuleError::Client { source, .. } => Some(source),
            RuleError::Ingress { source, .. } => Some(source),
            _ => None,
        }
    }
}
