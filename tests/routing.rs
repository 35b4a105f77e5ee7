//! End-to-end routing through a started client set, with in-memory backends

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use vibe_rule::client::{ClientOptions, EventSender, Subscription};
use vibe_rule::config::{ClientInfo, ClientKind};
use vibe_rule::rule::{Builder, RuleError};
use vibe_rule::{
    AckRef, Client, ClientError, ClientEvent, ClientFactory, Config, FunctionCaller,
    FunctionError, InboundPublish, OutboundMessage, QoS,
};

struct MemoryClient {
    name: String,
    kind: ClientKind,
    options: ClientOptions,
    fail_sends: bool,
    sent: Mutex<Vec<OutboundMessage>>,
    acks: Mutex<Vec<AckRef>>,
    events: Mutex<Option<EventSender>>,
    closed: AtomicBool,
}

impl MemoryClient {
    fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    fn acks(&self) -> Vec<AckRef> {
        self.acks.lock().clone()
    }

    async fn inject(&self, event: ClientEvent) {
        let tx = self.events.lock().clone().expect("client not started");
        tx.send(event).await.unwrap();
    }
}

#[async_trait]
impl Client for MemoryClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ClientKind {
        self.kind.clone()
    }

    async fn send_or_drop(&self, msg: OutboundMessage) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        if self.fail_sends {
            return Err(ClientError::Send("unavailable".to_string()));
        }
        self.sent.lock().push(msg);
        Ok(())
    }

    async fn send_ack(&self, ack: &AckRef) -> Result<(), ClientError> {
        self.acks.lock().push(ack.clone());
        Ok(())
    }

    async fn start(&self, events: Option<EventSender>) -> Result<(), ClientError> {
        let mut slot = self.events.lock();
        if slot.is_some() {
            return Err(ClientError::AlreadyStarted);
        }
        *slot = events;
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Creates [`MemoryClient`]s for mqtt and http entries. A `fail = true`
/// setting makes sends fail, `broken = true` makes creation fail.
#[derive(Default)]
struct MemoryFactory {
    created: Mutex<HashMap<String, Arc<MemoryClient>>>,
}

impl MemoryFactory {
    fn get(&self, name: &str) -> Arc<MemoryClient> {
        self.created.lock()[name].clone()
    }
}

#[async_trait]
impl ClientFactory for MemoryFactory {
    async fn create(
        &self,
        info: &ClientInfo,
        options: ClientOptions,
    ) -> Result<Arc<dyn Client>, ClientError> {
        let flag = |key: &str| info.value.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
        if flag("broken") {
            return Err(ClientError::Connection("refused".to_string()));
        }

        let client = Arc::new(MemoryClient {
            name: info.name.clone(),
            kind: info.kind.clone(),
            options,
            fail_sends: flag("fail"),
            sent: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.created
            .lock()
            .insert(info.name.clone(), client.clone());
        Ok(client)
    }

    fn supports(&self, kind: &ClientKind) -> bool {
        matches!(kind, ClientKind::Mqtt | ClientKind::Http)
    }
}

struct Functions;

#[async_trait]
impl FunctionCaller for Functions {
    async fn call(&self, name: &str, payload: Bytes) -> Result<Bytes, FunctionError> {
        match name {
            "f" if &payload[..] == b"X" => Ok(Bytes::from_static(b"Y")),
            "f" => Ok(payload),
            _ => Err(FunctionError::Transport("connection refused".to_string())),
        }
    }
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn builder(factory: &Arc<MemoryFactory>) -> Builder {
    Builder::new("edge", factory.clone(), Arc::new(Functions))
}

const CONFIG: &str = r#"
[defaults]
client = "broker"

[[clients]]
name = "broker"
kind = "mqtt"
address = "tcp://127.0.0.1:1883"

[[clients]]
name = "cloud"
kind = "mqtt"
address = "tcp://cloud:1883"

[[clients]]
name = "down"
kind = "mqtt"
address = "tcp://down:1883"
fail = true

[[clients]]
name = "web"
kind = "http"
address = "http://127.0.0.1:8080"

[[clients]]
name = "ingress"
kind = "http-server"
host = "127.0.0.1"
port = 0

[[rules]]
name = "transform"
source = { topic = "topic1", qos = 1 }
target = { client = "cloud", topic = "topic2", qos = 1 }
function = { name = "f" }

[[rules]]
name = "broken-fn"
source = { topic = "fails/in", qos = 1 }
target = { client = "cloud", topic = "fails/out", qos = 1 }
function = { name = "missing" }

[[rules]]
name = "unreachable"
source = { topic = "down/in", qos = 1 }
target = { client = "down", topic = "down/out", qos = 1 }

[[rules]]
name = "sink"
source = { topic = "sink/#", qos = 1 }

[[rules]]
name = "confirmed"
source = { topic = "group/+/in", qos = 1 }
target = { client = "cloud", topic = "group/+/out", qos = 1 }
ack = "delivered"

[[rules]]
name = "hook"
source = { client = "ingress" }
target = { client = "web", path = "/api/events" }
"#;

async fn start() -> (Arc<MemoryFactory>, vibe_rule::ClientSet) {
    let config = Config::parse(CONFIG).unwrap();
    let factory = Arc::new(MemoryFactory::default());
    let set = builder(&factory)
        .build(&config.clients, &config.rules)
        .await
        .unwrap();
    (factory, set)
}

fn publish(topic: &str, payload: &'static [u8], packet_id: u16) -> ClientEvent {
    ClientEvent::Publish(
        InboundPublish::new(topic, Bytes::from_static(payload), QoS::AtLeastOnce)
            .with_packet_id(packet_id),
    )
}

#[tokio::test]
async fn test_subscriptions_and_client_ids() {
    let (factory, set) = start().await;

    let broker = factory.get("broker");
    assert_eq!(broker.options.client_id, "edge-broker");
    assert_eq!(broker.options.subscriptions.len(), 5);
    assert!(broker
        .options
        .subscriptions
        .contains(&Subscription::new("group/+/in", QoS::AtLeastOnce)));
    assert!(factory.get("cloud").options.subscriptions.is_empty());
    assert!(set.get("ingress").is_none());
    assert!(set.ingress_addr().is_some());

    set.close().await;
    assert!(broker.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_transform_forward_and_ack() {
    let (factory, set) = start().await;
    let broker = factory.get("broker");
    let cloud = factory.get("cloud");

    broker.inject(publish("topic1", b"X", 21)).await;
    eventually(|| !broker.acks().is_empty()).await;

    let sent = cloud.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "topic2");
    assert_eq!(&sent[0].payload[..], b"Y");
    assert_eq!(broker.acks(), vec![AckRef::new("broker", 21)]);

    set.close().await;
}

#[tokio::test]
async fn test_failure_semantics() {
    let (factory, set) = start().await;
    let broker = factory.get("broker");

    // Function failure: no ack, so the broker redelivers
    broker.inject(publish("fails/in", b"X", 1)).await;
    // Forward failure: acked anyway
    broker.inject(publish("down/in", b"X", 2)).await;
    // No target: acked, nothing forwarded
    broker.inject(publish("sink/a", b"X", 3)).await;

    eventually(|| broker.acks().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        broker.acks(),
        vec![AckRef::new("broker", 2), AckRef::new("broker", 3)]
    );
    assert!(factory.get("cloud").sent().is_empty());
    assert!(factory.get("web").sent().is_empty());

    set.close().await;
}

#[tokio::test]
async fn test_delivered_ack_is_relayed_from_target() {
    let (factory, set) = start().await;
    let broker = factory.get("broker");
    let cloud = factory.get("cloud");

    broker.inject(publish("group/7/in", b"X", 42)).await;
    eventually(|| !cloud.sent().is_empty()).await;

    let sent = cloud.sent();
    assert_eq!(sent[0].topic, "group/7/out");
    let origin = sent[0].origin.clone().unwrap();
    assert!(broker.acks().is_empty());

    // The target confirms; its dispatcher acknowledges the source
    cloud.inject(ClientEvent::Ack(origin)).await;
    eventually(|| !broker.acks().is_empty()).await;
    assert_eq!(broker.acks(), vec![AckRef::new("broker", 42)]);

    set.close().await;
}

#[tokio::test]
async fn test_ingress_request_is_forwarded() {
    let (factory, set) = start().await;
    let addr = set.ingress_addr().unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/rules/hook", addr))
        .body("{\"temp\":21}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "success": true }));

    let sent = factory.get("web").sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "/api/events");
    assert_eq!(sent[0].target.method, "POST");

    let response = client
        .post(format!("http://{}/rules/nope", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    set.close().await;
}

#[tokio::test]
async fn test_build_errors() {
    let factory = Arc::new(MemoryFactory::default());

    let config = Config::parse(
        r#"
[[clients]]
name = "broker"
kind = "mqtt"

[[rules]]
name = "r"
source = { client = "broker", topic = "a" }
target = { client = "ghost", topic = "b" }
"#,
    )
    .unwrap();
    let err = builder(&factory)
        .build(&config.clients, &config.rules)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RuleError::UnknownClient { .. }));

    let clients = vec![ClientInfo::new("bucket", "s3")];
    let err = builder(&factory).build(&clients, &[]).await.err().unwrap();
    assert!(matches!(err, RuleError::UnsupportedClientKind { .. }));
}

#[tokio::test]
async fn test_build_is_all_or_nothing() {
    let factory = Arc::new(MemoryFactory::default());
    let clients = vec![
        ClientInfo::new("first", "mqtt"),
        ClientInfo::new("second", "mqtt").with("broken", true),
    ];

    let err = builder(&factory).build(&clients, &[]).await.err().unwrap();
    assert!(matches!(err, RuleError::Client { ref client, .. } if client == "second"));
    assert!(factory.get("first").closed.load(Ordering::SeqCst));
}
