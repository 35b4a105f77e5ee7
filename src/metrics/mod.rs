//! Prometheus metrics for the rule engine
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

mod server;

pub use server::MetricsServer;

/// All routing metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    /// Inbound messages by source client
    pub messages_received: IntCounterVec,
    /// Messages handed to a target, by rule
    pub messages_forwarded: IntCounterVec,
    /// Messages dropped on purpose (no target or empty result), by rule
    pub messages_filtered: IntCounterVec,
    /// Acknowledgments sent to sources
    pub messages_acked: IntCounter,
    /// Function call failures, by rule
    pub function_errors: IntCounterVec,
    /// Target submission failures, by rule
    pub forward_errors: IntCounterVec,
    /// Source messages waiting for a target acknowledgment
    pub deferred_acks: IntGauge,
}

fn counter_vec(name: &str, help: &str, label: &str) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), &[label]).unwrap()
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_received = counter_vec(
            "vibe_rule_messages_received_total",
            "Inbound messages received, by source client",
            "client",
        );
        let messages_forwarded = counter_vec(
            "vibe_rule_messages_forwarded_total",
            "Messages submitted to a target, by rule",
            "rule",
        );
        let messages_filtered = counter_vec(
            "vibe_rule_messages_filtered_total",
            "Messages dropped without forwarding, by rule",
            "rule",
        );
        let messages_acked = IntCounter::with_opts(Opts::new(
            "vibe_rule_messages_acked_total",
            "Acknowledgments sent to source clients",
        ))
        .unwrap();
        let function_errors = counter_vec(
            "vibe_rule_function_errors_total",
            "Function call failures, by rule",
            "rule",
        );
        let forward_errors = counter_vec(
            "vibe_rule_forward_errors_total",
            "Target submission failures, by rule",
            "rule",
        );
        let deferred_acks = IntGauge::with_opts(Opts::new(
            "vibe_rule_deferred_acks",
            "Source messages waiting for a target acknowledgment",
        ))
        .unwrap();

        registry
            .register(Box::new(messages_received.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_forwarded.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_filtered.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_acked.clone()))
            .unwrap();
        registry
            .register(Box::new(function_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(forward_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(deferred_acks.clone()))
            .unwrap();

        Metrics {
            registry,
            messages_received,
            messages_forwarded,
            messages_filtered,
            messages_acked,
            function_errors,
            forward_errors,
            deferred_acks,
        }
    }

    pub fn received(&self, client: &str) {
        self.messages_received.with_label_values(&[client]).inc();
    }

    pub fn forwarded(&self, rule: &str) {
        self.messages_forwarded.with_label_values(&[rule]).inc();
    }

    pub fn filtered(&self, rule: &str) {
        self.messages_filtered.with_label_values(&[rule]).inc();
    }

    pub fn acked(&self) {
        self.messages_acked.inc();
    }

    pub fn function_failed(&self, rule: &str) {
        self.function_errors.with_label_values(&[rule]).inc();
    }

    pub fn forward_failed(&self, rule: &str) {
        self.forward_errors.with_label_values(&[rule]).inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
