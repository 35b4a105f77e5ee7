//! Runtime clients
//!
//! A [`ClientSet`] owns every backend built from configuration plus the
//! optional HTTP ingress. Each backend gets its own event channel and
//! dispatcher task; the ingress starts last so that its targets are live
//! before the first request arrives.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use super::dispatch::Dispatcher;
use super::pipeline::Pipeline;
use super::server::IngressServer;
use super::RuleError;
use crate::client::{Client, Subscription};
use crate::config::RuleInfo;
use crate::topic::Matcher;

/// One backend plus the rules sourced on it
pub struct SingleClient {
    client: Arc<dyn Client>,
    subscriptions: Vec<Subscription>,
    matcher: Arc<Matcher>,
    rules: Arc<HashMap<String, RuleInfo>>,
}

impl SingleClient {
    pub fn new(
        client: Arc<dyn Client>,
        subscriptions: Vec<Subscription>,
        matcher: Matcher,
        rules: HashMap<String, RuleInfo>,
    ) -> Self {
        Self {
            client,
            subscriptions,
            matcher: Arc::new(matcher),
            rules: Arc::new(rules),
        }
    }

    pub fn name(&self) -> &str {
        self.client.name()
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn rules(&self) -> &HashMap<String, RuleInfo> {
        &self.rules
    }

    /// Whether any rule is sourced on this client
    pub fn is_source(&self) -> bool {
        !self.rules.is_empty()
    }
}

pub struct ClientSet {
    clients: HashMap<String, SingleClient>,
    ingress: Option<Arc<IngressServer>>,
    pipeline: Arc<Pipeline>,
    event_capacity: usize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    closed: AtomicBool,
}

impl ClientSet {
    pub fn new(
        clients: Vec<SingleClient>,
        ingress: Option<IngressServer>,
        pipeline: Arc<Pipeline>,
        event_capacity: usize,
    ) -> Self {
        Self {
            clients: clients
                .into_iter()
                .map(|c| (c.name().to_string(), c))
                .collect(),
            ingress: ingress.map(Arc::new),
            pipeline,
            event_capacity: event_capacity.max(1),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn get(&self, name: &str) -> Option<&SingleClient> {
        self.clients.get(name)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn ingress(&self) -> Option<&Arc<IngressServer>> {
        self.ingress.as_ref()
    }

    /// Address the ingress listens on, once started
    pub fn ingress_addr(&self) -> Option<SocketAddr> {
        self.ingress.as_ref().and_then(|s| s.local_addr())
    }

    /// Start dispatchers and backends, pure targets first, then the ingress
    pub async fn start(&self) -> Result<(), RuleError> {
        let (sources, targets): (Vec<&SingleClient>, Vec<&SingleClient>) =
            self.clients.values().partition(|c| c.is_source());

        for single in targets.into_iter().chain(sources) {
            let (tx, rx) = mpsc::channel(self.event_capacity);
            let dispatcher = Dispatcher::new(
                single.client.clone(),
                single.matcher.clone(),
                single.rules.clone(),
                self.pipeline.clone(),
            );
            self.tasks.spawn(dispatcher.run(rx, self.shutdown.clone()));

            single
                .client
                .start(Some(tx))
                .await
                .map_err(|source| RuleError::Client {
                    client: single.name().to_string(),
                    source,
                })?;
            info!(
                client = %single.name(),
                kind = %single.client.kind(),
                rules = single.rules.len(),
                "Client started"
            );
        }

        if let Some(ref ingress) = self.ingress {
            if ingress.rules().is_empty() {
                info!(server = %ingress.name(), "Ingress has no rules, not listening");
            } else {
                let listener = ingress.bind().await.map_err(|e| RuleError::Ingress {
                    server: ingress.name().to_string(),
                    source: e,
                })?;
                self.tasks.spawn(ingress.clone().serve(
                    listener,
                    self.shutdown.clone(),
                    self.tasks.clone(),
                ));
            }
        }

        Ok(())
    }

    /// Stop the ingress and every backend, then wait for dispatchers.
    /// Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        let closing = self.clients.values().map(|single| async move {
            if let Err(e) = single.client.close().await {
                error!(client = %single.name(), "Failed to close client: {}", e);
            }
        });
        join_all(closing).await;

        self.tasks.close();
        self.tasks.wait().await;
        info!("Client set closed");
    }
}
