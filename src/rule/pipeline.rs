//! Function-then-forward processing of one message for one rule
//!
//! Shared by the per-connection dispatcher and the HTTP ingress. The outcome
//! tells the caller whether the source may be acknowledged:
//!
//! | outcome          | source ack                           |
//! |------------------|--------------------------------------|
//! | `TransformFailed`| withheld, the source redelivers      |
//! | `Filtered`       | sent                                 |
//! | `Forwarded`      | sent                                 |
//! | `ForwardFailed`  | sent, delivery is best effort        |
//! | `Deferred`       | sent by the target's acknowledgment  |

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error};

use super::rewrite::rewrite;
use crate::client::{Client, ClientError};
use crate::config::RuleInfo;
use crate::function::{FunctionCaller, FunctionError};
use crate::message::{AckRef, InboundPublish, OutboundMessage};
use crate::metrics::Metrics;

/// Result of running one rule on one message
#[derive(Debug)]
pub enum Outcome {
    /// The function call failed
    TransformFailed(FunctionError),
    /// No target, or the function returned nothing
    Filtered,
    /// Submitted to the target
    Forwarded,
    /// The target refused the submission
    ForwardFailed(ClientError),
    /// Submitted; the source is acknowledged once the target confirms
    Deferred,
}

impl Outcome {
    pub fn is_transform_failure(&self) -> bool {
        matches!(self, Outcome::TransformFailed(_))
    }
}

pub struct Pipeline {
    clients: HashMap<String, Arc<dyn Client>>,
    function: Arc<dyn FunctionCaller>,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(
        clients: HashMap<String, Arc<dyn Client>>,
        function: Arc<dyn FunctionCaller>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            clients,
            function,
            metrics,
        }
    }

    pub fn client(&self, name: &str) -> Option<&Arc<dyn Client>> {
        self.clients.get(name)
    }

    pub fn clients(&self) -> impl Iterator<Item = &Arc<dyn Client>> {
        self.clients.values()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Run `rule` on `publish`.
    ///
    /// `origin` is attached to the outbound message when the source
    /// acknowledgment should wait for the target; the result is then
    /// `Deferred` instead of `Forwarded`.
    pub async fn process(
        &self,
        rule: &RuleInfo,
        publish: &InboundPublish,
        origin: Option<AckRef>,
    ) -> Outcome {
        let mut data = publish.payload.clone();

        if let Some(ref function) = rule.function {
            debug!(rule = %rule.name, function = %function.name, "Calling function");
            match self.function.call(&function.name, data).await {
                Ok(out) => data = out,
                Err(e) => {
                    error!(rule = %rule.name, function = %function.name, "Function call failed: {}", e);
                    self.metrics.function_failed(&rule.name);
                    return Outcome::TransformFailed(e);
                }
            }
        }

        let target = match rule.target {
            Some(ref target) if !data.is_empty() => target,
            _ => {
                debug!(rule = %rule.name, topic = %publish.topic, "Message filtered");
                self.metrics.filtered(&rule.name);
                return Outcome::Filtered;
            }
        };

        let outbound = self.outbound(rule, publish, data, origin);
        let deferred = outbound.origin.is_some();

        let result = match self.clients.get(&target.client) {
            Some(client) => client.send_or_drop(outbound).await,
            None => Err(ClientError::Other(format!(
                "target client '{}' not found",
                target.client
            ))),
        };

        match result {
            Ok(()) => {
                debug!(rule = %rule.name, target = %target.client, "Message forwarded");
                self.metrics.forwarded(&rule.name);
                if deferred {
                    self.metrics.deferred_acks.inc();
                    Outcome::Deferred
                } else {
                    Outcome::Forwarded
                }
            }
            Err(e) => {
                error!(rule = %rule.name, target = %target.client, "Failed to send to target: {}", e);
                self.metrics.forward_failed(&rule.name);
                Outcome::ForwardFailed(e)
            }
        }
    }

    fn outbound(
        &self,
        rule: &RuleInfo,
        publish: &InboundPublish,
        data: Bytes,
        origin: Option<AckRef>,
    ) -> OutboundMessage {
        let target = rule.target.clone().unwrap_or_default();
        let topic = rewrite(&rule.source.topic, &publish.topic, &target.topic, &target.path);
        let qos = publish.qos.min(target.qos);

        let mut msg = OutboundMessage::new(topic, data, target);
        msg.qos = qos;
        msg.retain = publish.retain;
        msg.dup = publish.dup;
        msg.origin = origin.filter(|_| qos.requires_ack());
        msg
    }
}
