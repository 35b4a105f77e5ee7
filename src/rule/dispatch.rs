//! Per-connection dispatcher
//!
//! One dispatcher task consumes the event channel of one client, so events
//! from the same connection are handled strictly in order while different
//! connections proceed in parallel. A slow function call throttles only the
//! connection it was triggered from.
//!
//! An inbound message may match several rules. They all run on the original
//! payload, and the message is acknowledged once:
//!
//! - never for QoS 0
//! - not at all when any rule failed its function call (the source redelivers)
//! - by the target connection when the only matching rule waits for delivery
//! - immediately otherwise, including when no rule matched

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::pipeline::{Outcome, Pipeline};
use crate::client::{Client, ClientEvent};
use crate::config::{AckMode, RuleInfo};
use crate::message::{AckRef, InboundPublish};
use crate::topic::Matcher;

/// Acknowledgment to give the source for one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// QoS 0
    NotRequired,
    /// Acknowledge now
    Ack,
    /// Withhold so the source redelivers
    Redeliver,
    /// The target connection acknowledges on delivery
    Deferred,
}

impl AckDecision {
    /// Fold per-rule outcomes into the message-level decision
    pub fn from_outcomes(publish: &InboundPublish, outcomes: &[Outcome]) -> Self {
        if !publish.qos.requires_ack() {
            AckDecision::NotRequired
        } else if outcomes.iter().any(Outcome::is_transform_failure) {
            AckDecision::Redeliver
        } else if outcomes.iter().any(|o| matches!(o, Outcome::Deferred)) {
            AckDecision::Deferred
        } else {
            AckDecision::Ack
        }
    }
}

pub struct Dispatcher {
    name: Arc<str>,
    client: Arc<dyn Client>,
    matcher: Arc<Matcher>,
    rules: Arc<HashMap<String, RuleInfo>>,
    pipeline: Arc<Pipeline>,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn Client>,
        matcher: Arc<Matcher>,
        rules: Arc<HashMap<String, RuleInfo>>,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        Self {
            name: Arc::from(client.name()),
            client,
            matcher,
            rules,
            pipeline,
        }
    }

    /// Consume `events` until the channel closes or `cancel` fires
    pub async fn run(self, mut events: mpsc::Receiver<ClientEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event).await;
        }
        debug!(client = %self.name, "Dispatcher stopped");
    }

    pub async fn handle_event(&self, event: ClientEvent) {
        match event {
            ClientEvent::Publish(publish) => {
                self.on_publish(publish).await;
            }
            ClientEvent::Ack(ack) => self.on_ack(ack).await,
            ClientEvent::Error(e) => {
                warn!(client = %self.name, "Client error: {}", e);
            }
        }
    }

    /// Run every matching rule on `publish` and acknowledge it accordingly
    pub async fn on_publish(&self, publish: InboundPublish) -> AckDecision {
        debug!(
            client = %self.name,
            topic = %publish.topic,
            packet_id = publish.packet_id,
            qos = %publish.qos,
            "Processing message"
        );
        self.pipeline.metrics().received(&self.name);

        let matched = self.matcher.matches(&publish.topic);
        let mut outcomes = Vec::with_capacity(matched.len());

        for name in &matched {
            let Some(rule) = self.rules.get(name.as_ref()) else {
                continue;
            };

            // Waiting for the target is only sound when no other rule
            // shares the acknowledgment of this message
            let origin = (rule.ack == AckMode::Delivered
                && matched.len() == 1
                && publish.qos.requires_ack())
            .then(|| AckRef::new(self.name.clone(), publish.packet_id));

            outcomes.push(self.pipeline.process(rule, &publish, origin).await);
        }

        let decision = AckDecision::from_outcomes(&publish, &outcomes);
        match decision {
            AckDecision::Ack => {
                let ack = AckRef::new(self.name.clone(), publish.packet_id);
                match self.client.send_ack(&ack).await {
                    Ok(()) => self.pipeline.metrics().acked(),
                    Err(e) => error!(client = %self.name, %ack, "Failed to send ack: {}", e),
                }
            }
            AckDecision::Redeliver => {
                debug!(client = %self.name, packet_id = publish.packet_id, "Ack withheld for redelivery");
            }
            AckDecision::Deferred | AckDecision::NotRequired => {}
        }
        decision
    }

    /// A target confirmed a forwarded message; acknowledge its source
    pub async fn on_ack(&self, ack: AckRef) {
        self.pipeline.metrics().deferred_acks.dec();

        let Some(source) = self.pipeline.client(&ack.client) else {
            warn!(client = %self.name, %ack, "Ack for unknown source client");
            return;
        };
        match source.send_ack(&ack).await {
            Ok(()) => {
                debug!(client = %self.name, %ack, "Relayed target ack to source");
                self.pipeline.metrics().acked();
            }
            Err(e) => error!(client = %self.name, %ack, "Failed to relay ack: {}", e),
        }
    }
}
