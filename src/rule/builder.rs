//! Client set builder
//!
//! Building happens in two phases:
//!
//! 1. [`plan`] validates clients and rules and computes, per client, the
//!    subscription list, the topic matcher and the rules sourced on it. It is
//!    pure and does no I/O.
//! 2. [`Builder::build`] instantiates one backend per planned client through
//!    a [`ClientFactory`], wires the ingress, and starts everything. Any
//!    failure closes what was already created and aborts the build.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};

use super::client_set::{ClientSet, SingleClient};
use super::pipeline::Pipeline;
use super::server::IngressServer;
use super::RuleError;
use crate::client::{tls, Client, ClientError, ClientFactory, ClientOptions, Subscription};
use crate::config::{AckMode, AdapterConfig, ClientInfo, ClientKind, HttpServerConfig, RuleInfo};
use crate::function::FunctionCaller;
use crate::metrics::Metrics;
use crate::topic::{validate_topic_filter, Matcher};

/// Planned backend
#[derive(Debug)]
pub struct ClientPlan {
    pub info: ClientInfo,
    /// `{node}-{client}`
    pub client_id: String,
    /// One entry per distinct source pattern, at the highest QoS requested
    pub subscriptions: Vec<Subscription>,
    pub matcher: Matcher,
    /// Rules sourced on this client, by name
    pub rules: HashMap<String, RuleInfo>,
}

/// Planned HTTP ingress
#[derive(Debug)]
pub struct IngressPlan {
    pub info: ClientInfo,
    pub rules: HashMap<String, RuleInfo>,
}

#[derive(Debug)]
pub struct Plan {
    pub clients: Vec<ClientPlan>,
    pub ingress: Option<IngressPlan>,
}

impl Plan {
    pub fn client(&self, name: &str) -> Option<&ClientPlan> {
        self.clients.iter().find(|c| c.info.name == name)
    }
}

fn add_subscription(subscriptions: &mut Vec<Subscription>, sub: Subscription) {
    match subscriptions.iter_mut().find(|s| s.topic == sub.topic) {
        Some(existing) => existing.qos = existing.qos.max(sub.qos),
        None => subscriptions.push(sub),
    }
}

fn check_target_topic(rule: &RuleInfo, topic: &str) -> Result<(), RuleError> {
    let reason = if topic.is_empty() {
        "target topic is empty"
    } else if topic.contains('#') {
        "target topic cannot contain '#'"
    } else {
        return Ok(());
    };
    Err(RuleError::InvalidTopic {
        rule: rule.name.clone(),
        topic: topic.to_string(),
        reason: reason.to_string(),
    })
}

/// Validate `clients` and `rules` and lay out the client set
pub fn plan(node_name: &str, clients: &[ClientInfo], rules: &[RuleInfo]) -> Result<Plan, RuleError> {
    let mut names = HashSet::new();
    let mut kinds: HashMap<&str, &ClientKind> = HashMap::new();
    let mut planned = Vec::new();
    let mut ingress: Option<IngressPlan> = None;

    for info in clients {
        if !names.insert(info.name.as_str()) {
            return Err(RuleError::DuplicateName(info.name.clone()));
        }
        kinds.insert(&info.name, &info.kind);

        if let ClientKind::Other(_) = info.kind {
            return Err(RuleError::UnsupportedClientKind {
                client: info.name.clone(),
                kind: info.kind.clone(),
            });
        }

        if info.kind == ClientKind::HttpServer {
            if let Some(ref first) = ingress {
                return Err(RuleError::DuplicateIngress {
                    first: first.info.name.clone(),
                    second: info.name.clone(),
                });
            }
            ingress = Some(IngressPlan {
                info: info.clone(),
                rules: HashMap::new(),
            });
            continue;
        }

        planned.push(ClientPlan {
            info: info.clone(),
            client_id: format!("{}-{}", node_name, info.name),
            subscriptions: Vec::new(),
            matcher: Matcher::new(),
            rules: HashMap::new(),
        });
    }

    let mut rule_names = HashSet::new();
    for rule in rules {
        if !rule_names.insert(rule.name.as_str()) {
            return Err(RuleError::DuplicateName(rule.name.clone()));
        }

        let unknown = |client: &str| RuleError::UnknownClient {
            rule: rule.name.clone(),
            client: client.to_string(),
        };

        let source_kind = *kinds
            .get(rule.source.client.as_str())
            .ok_or_else(|| unknown(&rule.source.client))?;

        let mut rule = rule.clone();
        let mut target_is_mqtt = false;
        if let Some(ref target) = rule.target {
            let kind = *kinds
                .get(target.client.as_str())
                .ok_or_else(|| unknown(&target.client))?;
            match kind {
                ClientKind::HttpServer => {
                    return Err(RuleError::InvalidTarget {
                        rule: rule.name.clone(),
                        client: target.client.clone(),
                    })
                }
                ClientKind::Mqtt => {
                    let topic = if target.path.is_empty() {
                        &target.topic
                    } else {
                        &target.path
                    };
                    check_target_topic(&rule, topic)?;
                    target_is_mqtt = true;
                }
                _ => {}
            }
        }

        if rule.ack == AckMode::Delivered && !target_is_mqtt {
            warn!(rule = %rule.name, "ack = \"delivered\" needs an mqtt target, using \"forwarded\"");
            rule.ack = AckMode::Forwarded;
        }

        match source_kind {
            ClientKind::HttpServer => {
                if let Some(ref mut ingress) = ingress {
                    ingress.rules.insert(rule.name.clone(), rule);
                }
            }
            ClientKind::Mqtt => {
                validate_topic_filter(&rule.source.topic).map_err(|reason| {
                    RuleError::InvalidTopic {
                        rule: rule.name.clone(),
                        topic: rule.source.topic.clone(),
                        reason: reason.to_string(),
                    }
                })?;

                let source = planned
                    .iter_mut()
                    .find(|c| c.info.name == rule.source.client)
                    .ok_or_else(|| unknown(&rule.source.client))?;
                add_subscription(
                    &mut source.subscriptions,
                    Subscription::new(rule.source.topic.clone(), rule.effective_qos()),
                );
                source.matcher.add(&rule.source.topic, &rule.name);
                source.rules.insert(rule.name.clone(), rule);
            }
            _ => {
                return Err(RuleError::InvalidSource {
                    rule: rule.name.clone(),
                    client: rule.source.client.clone(),
                })
            }
        }
    }

    Ok(Plan {
        clients: planned,
        ingress,
    })
}

/// Builds and starts a [`ClientSet`]
pub struct Builder {
    node_name: String,
    factory: Arc<dyn ClientFactory>,
    function: Arc<dyn FunctionCaller>,
    metrics: Arc<Metrics>,
    adapter: AdapterConfig,
}

impl Builder {
    pub fn new(
        node_name: impl Into<String>,
        factory: Arc<dyn ClientFactory>,
        function: Arc<dyn FunctionCaller>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            factory,
            function,
            metrics: Arc::new(Metrics::new()),
            adapter: AdapterConfig::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_adapter(mut self, adapter: AdapterConfig) -> Self {
        self.adapter = adapter;
        self
    }

    /// Plan, instantiate and start. All or nothing.
    pub async fn build(
        &self,
        clients: &[ClientInfo],
        rules: &[RuleInfo],
    ) -> Result<ClientSet, RuleError> {
        let plan = plan(&self.node_name, clients, rules)?;

        for planned in &plan.clients {
            if !self.factory.supports(&planned.info.kind) {
                return Err(RuleError::UnsupportedClientKind {
                    client: planned.info.name.clone(),
                    kind: planned.info.kind.clone(),
                });
            }
        }

        let mut created: Vec<(ClientPlan, Arc<dyn Client>)> = Vec::with_capacity(plan.clients.len());
        for planned in plan.clients {
            let mut options = ClientOptions::new(planned.client_id.clone());
            options.subscriptions = planned.subscriptions.clone();
            options.adapter = self.adapter.clone();

            match self.factory.create(&planned.info, options).await {
                Ok(client) => created.push((planned, client)),
                Err(source) => {
                    close_all(created.iter().map(|(_, c)| c)).await;
                    return Err(RuleError::Client {
                        client: planned.info.name.clone(),
                        source,
                    });
                }
            }
        }

        let handles: HashMap<String, Arc<dyn Client>> = created
            .iter()
            .map(|(planned, client)| (planned.info.name.clone(), client.clone()))
            .collect();
        let pipeline = Arc::new(Pipeline::new(
            handles,
            self.function.clone(),
            self.metrics.clone(),
        ));

        let ingress = match plan.ingress {
            Some(ingress) => match ingress_server(ingress, pipeline.clone()) {
                Ok(server) => Some(server),
                Err(e) => {
                    close_all(pipeline.clients()).await;
                    return Err(e);
                }
            },
            None => None,
        };

        let singles = created
            .into_iter()
            .map(|(planned, client)| {
                SingleClient::new(client, planned.subscriptions, planned.matcher, planned.rules)
            })
            .collect();

        let set = ClientSet::new(singles, ingress, pipeline, self.adapter.capacity);
        if let Err(e) = set.start().await {
            set.close().await;
            return Err(e);
        }

        info!(clients = set.len(), rules = rules.len(), "Rule engine started");
        Ok(set)
    }
}

fn ingress_server(plan: IngressPlan, pipeline: Arc<Pipeline>) -> Result<IngressServer, RuleError> {
    let name = plan.info.name.clone();
    let client_error = |source: ClientError| RuleError::Client {
        client: name.clone(),
        source,
    };

    let config: HttpServerConfig = plan
        .info
        .parse()
        .map_err(|e| client_error(ClientError::from(e)))?;
    let acceptor = tls::server_acceptor(&config.tls).map_err(|e| client_error(e.into()))?;

    Ok(IngressServer::new(
        plan.info.name.clone(),
        &config,
        plan.rules,
        pipeline,
        acceptor,
    ))
}

async fn close_all<'a>(clients: impl Iterator<Item = &'a Arc<dyn Client>>) {
    for client in clients {
        if let Err(e) = client.close().await {
            warn!(client = %client.name(), "Failed to close client: {}", e);
        }
    }
}
