//! MQTT backend
//!
//! Wraps a rumqttc client with manual acknowledgments: inbound QoS 1 messages
//! are only acknowledged when the routing engine calls `send_ack`.
//!
//! The connection task owns the rumqttc event loop. It re-subscribes the
//! aggregated subscription list on every CONNACK, turns inbound publishes
//! into [`ClientEvent::Publish`], and backs off exponentially between failed
//! connection attempts.
//!
//! The event loop also carries this connection's own publishes and acks, so
//! it must keep polling while the dispatcher is busy. Events therefore reach
//! the dispatcher through an [`EventRelay`] task. When the relay backlog is
//! full, QoS 0 publishes and error events are dropped; QoS 1 publishes are
//! bounded by the broker's inflight window and always kept.
//!
//! # Outbound acknowledgment correlation
//!
//! Packet identifiers of forwarded messages are assigned by this connection,
//! never reused from the source. Each QoS 1 publish records the source
//! message waiting for it (if any); rumqttc reports the identifier it picked
//! through `Outgoing::Publish`, in request order, and the matching PUBACK
//! releases the source reference as [`ClientEvent::Ack`]. Several sources can
//! therefore share one target connection without identifier collisions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError as MqttError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    Publish, SubscribeFilter, Transport,
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{tls, Client, ClientError, ClientEvent, ClientOptions, EventSender, Subscription};
use crate::config::{ClientKind, MqttClientConfig, SubmitMode};
use crate::message::{AckRef, InboundPublish, OutboundMessage, QoS};

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

/// Host, port and whether TLS is implied by the scheme
pub fn parse_address(address: &str) -> Result<(String, u16, bool), ClientError> {
    let url = Url::parse(address)
        .map_err(|e| ClientError::InvalidConfig(format!("invalid mqtt address '{}': {}", address, e)))?;

    let host = url
        .host_str()
        .ok_or_else(|| ClientError::InvalidConfig(format!("mqtt address '{}' has no host", address)))?
        .to_string();

    let (default_port, tls) = match url.scheme().to_ascii_lowercase().as_str() {
        "tcp" | "mqtt" => (1883, false),
        "ssl" | "tls" | "mqtts" => (8883, true),
        other => {
            return Err(ClientError::InvalidConfig(format!(
                "unsupported mqtt scheme '{}'",
                other
            )))
        }
    };

    Ok((host, url.port().unwrap_or(default_port), tls))
}

/// rumqttc options for a client entry
pub fn build_options(config: &MqttClientConfig, client_id: &str) -> Result<MqttOptions, ClientError> {
    let (host, port, scheme_tls) = parse_address(&config.address)?;

    let mut options = MqttOptions::new(client_id, host, port);
    options
        .set_keep_alive(config.keepalive)
        .set_clean_session(config.clean_session)
        .set_inflight(config.max_inflight.max(1))
        .set_manual_acks(true);

    if let Some(ref username) = config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }

    if scheme_tls || !config.tls.is_empty() {
        if config.tls.insecure_skip_verify {
            warn!(address = %config.address, "insecure_skip_verify is not supported for mqtt, verifying peer");
        }
        let transport = match config.tls.ca {
            Some(ref ca) => Transport::tls(tls::read_pem(ca)?, tls::client_identity(&config.tls)?, None),
            None => Transport::tls_with_default_config(),
        };
        options.set_transport(transport);
    }

    Ok(options)
}

/// Outbound packet id -> waiting source message
#[derive(Debug, Default)]
pub struct Correlation {
    /// Origins of QoS 1 publishes not yet assigned an identifier, in request order
    pending: Mutex<VecDeque<Option<AckRef>>>,
    /// Origins by assigned identifier, until PUBACK
    in_flight: DashMap<u16, Option<AckRef>>,
}

impl Correlation {
    /// Record a QoS 1 publish about to be requested
    pub fn push(&self, origin: Option<AckRef>) {
        self.pending.lock().push_back(origin);
    }

    /// Undo the last `push` when the request could not be queued
    pub fn rollback(&self) {
        self.pending.lock().pop_back();
    }

    /// rumqttc sent a publish with `pkid`
    pub fn on_outgoing(&self, pkid: u16) {
        // Retransmissions report an identifier that is already tracked
        if pkid == 0 || self.in_flight.contains_key(&pkid) {
            return;
        }
        if let Some(origin) = self.pending.lock().pop_front() {
            self.in_flight.insert(pkid, origin);
        }
    }

    /// PUBACK for `pkid`; returns the source message to acknowledge
    pub fn on_puback(&self, pkid: u16) -> Option<AckRef> {
        self.in_flight.remove(&pkid).and_then(|(_, origin)| origin)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Upper bound for writing DISCONNECT on close
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Hands connection events to the dispatcher from a separate task
struct EventRelay {
    queue: mpsc::UnboundedSender<ClientEvent>,
    /// Events queued but not yet accepted by the dispatcher
    pending: Arc<AtomicUsize>,
    limit: usize,
}

impl EventRelay {
    fn spawn(name: String, events: EventSender, limit: usize, cancel: CancellationToken) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = pending.clone();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = events.send(event) => sent,
                };
                counter.fetch_sub(1, Ordering::AcqRel);
                if sent.is_err() {
                    debug!(client = %name, "Event receiver dropped");
                    break;
                }
            }
        });

        Self {
            queue,
            pending,
            limit: limit.max(1),
        }
    }

    /// Queue `event`; returns false when it was dropped
    fn push(&self, event: ClientEvent) -> bool {
        let droppable = match event {
            ClientEvent::Publish(ref publish) => !publish.qos.requires_ack(),
            ClientEvent::Error(_) => true,
            ClientEvent::Ack(_) => false,
        };
        if droppable && self.backlog() >= self.limit {
            return false;
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.queue.send(event).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    fn backlog(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

pub struct MqttClient {
    name: String,
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    subscriptions: Vec<Subscription>,
    correlation: Arc<Correlation>,
    /// Serializes (record origin, request publish) so identifiers line up
    send_lock: AsyncMutex<()>,
    submit: SubmitMode,
    submit_timeout: Duration,
    reconnect_interval: Duration,
    max_reconnect_interval: Duration,
    event_backlog: usize,
    cancel: CancellationToken,
}

impl MqttClient {
    pub fn new(
        name: &str,
        config: MqttClientConfig,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let mqtt_options = build_options(&config, &options.client_id)?;
        let (client, eventloop) = AsyncClient::new(mqtt_options, config.inbound_capacity.max(1));

        Ok(Self {
            name: name.to_string(),
            client,
            eventloop: Mutex::new(Some(eventloop)),
            subscriptions: options.subscriptions,
            correlation: Arc::new(Correlation::default()),
            send_lock: AsyncMutex::new(()),
            submit: options.adapter.submit,
            submit_timeout: options.adapter.submit_timeout,
            reconnect_interval: config.reconnect_interval,
            max_reconnect_interval: config.max_reconnect_interval,
            event_backlog: config.event_backlog,
            cancel: CancellationToken::new(),
        })
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    async fn request_publish(&self, msg: &OutboundMessage) -> Result<(), ClientError> {
        let qos = to_mqtt_qos(msg.qos);
        let map_err = |e: MqttError| ClientError::Send(e.to_string());

        if self.submit == SubmitMode::Drop {
            return self
                .client
                .try_publish(msg.topic.clone(), qos, msg.retain, msg.payload.to_vec())
                .map_err(|e| match e {
                    MqttError::TryRequest(_) => ClientError::QueueFull,
                    other => map_err(other),
                });
        }

        let publish = self
            .client
            .publish_bytes(msg.topic.clone(), qos, msg.retain, msg.payload.clone());
        match self.submit {
            SubmitMode::Timeout => tokio::time::timeout(self.submit_timeout, publish)
                .await
                .map_err(|_| ClientError::Timeout)?
                .map_err(map_err),
            _ => publish.await.map_err(map_err),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn connection_loop(
        name: String,
        mut eventloop: EventLoop,
        client: AsyncClient,
        subscriptions: Vec<Subscription>,
        correlation: Arc<Correlation>,
        relay: Option<EventRelay>,
        cancel: CancellationToken,
        reconnect_interval: Duration,
        max_reconnect_interval: Duration,
    ) {
        let mut retry_interval = reconnect_interval;
        let mut connected = false;
        let mut dropped: u64 = 0;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => event,
            };

            let client_event = match event {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    info!(client = %name, session_present = connack.session_present, "Connected");
                    retry_interval = reconnect_interval;
                    connected = true;

                    if !subscriptions.is_empty() {
                        let filters = subscriptions
                            .iter()
                            .map(|s| SubscribeFilter::new(s.topic.clone(), to_mqtt_qos(s.qos)));
                        if let Err(e) = client.try_subscribe_many(filters) {
                            error!(client = %name, "Failed to subscribe: {}", e);
                        } else {
                            debug!(client = %name, count = subscriptions.len(), "Subscribed");
                        }
                    }
                    None
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let qos = match publish.qos {
                        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
                        // QoS 2 is never requested; treat a broker downgrade as QoS 1
                        _ => QoS::AtLeastOnce,
                    };
                    let mut inbound = InboundPublish::new(publish.topic, publish.payload, qos)
                        .with_packet_id(publish.pkid);
                    inbound.retain = publish.retain;
                    inbound.dup = publish.dup;
                    Some(ClientEvent::Publish(inbound))
                }
                Ok(Event::Incoming(Packet::PubAck(puback))) => {
                    correlation.on_puback(puback.pkid).map(ClientEvent::Ack)
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    correlation.on_outgoing(pkid);
                    None
                }
                Ok(_) => None,
                Err(e) => {
                    warn!(client = %name, "Connection error: {}, reconnecting in {:?}", e, retry_interval);
                    connected = false;
                    if let Some(ref relay) = relay {
                        relay.push(ClientEvent::Error(ClientError::Connection(e.to_string())));
                    }

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(retry_interval) => {}
                    }
                    retry_interval = std::cmp::min(retry_interval * 2, max_reconnect_interval);
                    None
                }
            };

            if let (Some(event), Some(relay)) = (client_event, relay.as_ref()) {
                if relay.push(event) {
                    if dropped > 0 {
                        info!(client = %name, dropped, "Event backlog drained");
                        dropped = 0;
                    }
                } else {
                    if dropped == 0 {
                        warn!(client = %name, backlog = relay.backlog(), "Event backlog full, dropping QoS 0 messages");
                    }
                    dropped += 1;
                }
            }
        }

        if connected {
            // Write the DISCONNECT queued by `close`
            let flush = async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            };
            if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
                debug!(client = %name, "Disconnect not flushed");
            }
        }

        debug!(client = %name, "Connection loop stopped");
    }
}

#[async_trait]
impl Client for MqttClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Mqtt
    }

    async fn send_or_drop(&self, msg: OutboundMessage) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ClientError::Closed),
            result = async {
                let _guard = self.send_lock.lock().await;
                if msg.qos.requires_ack() {
                    self.correlation.push(msg.origin.clone());
                }
                let result = self.request_publish(&msg).await;
                if result.is_err() && msg.qos.requires_ack() {
                    self.correlation.rollback();
                }
                result
            } => result,
        };

        if result.is_ok() {
            debug!(client = %self.name, topic = %msg.topic, qos = %msg.qos, "Publish queued");
        }
        result
    }

    async fn send_ack(&self, ack: &AckRef) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let mut publish = Publish::new("", rumqttc::QoS::AtLeastOnce, Vec::<u8>::new());
        publish.pkid = ack.packet_id;
        self.client
            .ack(&publish)
            .await
            .map_err(|e| ClientError::Send(format!("ack {}: {}", ack, e)))
    }

    async fn start(&self, events: Option<EventSender>) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let eventloop = self
            .eventloop
            .lock()
            .take()
            .ok_or(ClientError::AlreadyStarted)?;

        let relay = events.map(|tx| {
            EventRelay::spawn(self.name.clone(), tx, self.event_backlog, self.cancel.clone())
        });
        tokio::spawn(Self::connection_loop(
            self.name.clone(),
            eventloop,
            self.client.clone(),
            self.subscriptions.clone(),
            self.correlation.clone(),
            relay,
            self.cancel.clone(),
            self.reconnect_interval,
            self.max_reconnect_interval,
        ));
        info!(client = %self.name, subscriptions = self.subscriptions.len(), "Client started");
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        // Queued before cancelling so the loop flushes it on the way out
        if let Err(e) = self.client.try_disconnect() {
            debug!(client = %self.name, "Disconnect not sent: {}", e);
        }
        self.cancel.cancel();
        info!(client = %self.name, "Client closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientInfo, ClientRef};
    use bytes::Bytes;
    use std::future::Future;
    use test_case::test_case;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test_case("tcp://127.0.0.1:1884", "127.0.0.1", 1884, false; "tcp with port")]
    #[test_case("mqtt://broker", "broker", 1883, false; "mqtt default port")]
    #[test_case("ssl://broker", "broker", 8883, true; "ssl default port")]
    #[test_case("mqtts://broker:9883", "broker", 9883, true; "mqtts with port")]
    fn test_parse_address(address: &str, host: &str, port: u16, tls: bool) {
        assert_eq!(parse_address(address).unwrap(), (host.to_string(), port, tls));
    }

    #[test]
    fn test_parse_address_rejects_unknown_scheme() {
        assert!(parse_address("ws://broker:80").is_err());
        assert!(parse_address("broker:1883").is_err());
    }

    fn config(address: &str) -> MqttClientConfig {
        ClientInfo::new("broker", "mqtt")
            .with("address", address)
            .with("reconnect_interval", "10ms")
            .parse()
            .unwrap()
    }

    #[test]
    fn test_build_options() {
        let mut cfg = config("tcp://127.0.0.1:1883");
        cfg.username = Some("rule".into());
        let options = build_options(&cfg, "vibe-rule-broker").unwrap();

        assert_eq!(options.client_id(), "vibe-rule-broker");
        assert_eq!(options.broker_address(), ("127.0.0.1".to_string(), 1883));
        assert!(options.manual_acks());
        assert!(options.clean_session());
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
    }

    #[test]
    fn test_correlation_maps_assigned_ids() {
        let correlation = Correlation::default();
        correlation.push(Some(AckRef::new("src-a", 7)));
        correlation.push(None);
        correlation.push(Some(AckRef::new("src-b", 7)));

        correlation.on_outgoing(1);
        correlation.on_outgoing(2);
        correlation.on_outgoing(3);
        // Retransmission of an in-flight id does not consume an entry
        correlation.on_outgoing(1);
        assert_eq!(correlation.in_flight(), 3);

        assert_eq!(correlation.on_puback(3), Some(AckRef::new("src-b", 7)));
        assert_eq!(correlation.on_puback(2), None);
        assert_eq!(correlation.on_puback(1), Some(AckRef::new("src-a", 7)));
        assert_eq!(correlation.on_puback(1), None);
        assert_eq!(correlation.in_flight(), 0);
    }

    #[test]
    fn test_correlation_ignores_qos0_and_rollback() {
        let correlation = Correlation::default();
        correlation.on_outgoing(0);
        correlation.push(Some(AckRef::new("src", 1)));
        correlation.rollback();
        correlation.on_outgoing(5);
        assert_eq!(correlation.on_puback(5), None);
        assert_eq!(correlation.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_lifecycle_without_broker() {
        let client = MqttClient::new(
            "broker",
            config("tcp://127.0.0.1:1"),
            ClientOptions::new("test-broker"),
        )
        .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        client.start(Some(tx)).await.unwrap();
        assert!(matches!(
            client.start(None).await,
            Err(ClientError::AlreadyStarted)
        ));

        // Connection refused surfaces as an error event
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ClientEvent::Error(ClientError::Connection(_))));

        client.close().await.unwrap();
        client.close().await.unwrap();
        let msg = OutboundMessage::new("out", "x", ClientRef::default());
        assert!(matches!(
            client.send_or_drop(msg).await,
            Err(ClientError::Closed)
        ));
    }

    #[test]
    fn test_relay_drops_only_qos0_when_full() {
        let (queue, mut rx) = mpsc::unbounded_channel();
        let relay = EventRelay {
            queue,
            pending: Arc::default(),
            limit: 2,
        };
        let qos0 = || ClientEvent::Publish(InboundPublish::new("t", "x", QoS::AtMostOnce));

        assert!(relay.push(qos0()));
        assert!(relay.push(qos0()));
        assert!(!relay.push(qos0()));
        assert!(!relay.push(ClientEvent::Error(ClientError::Timeout)));
        assert!(relay.push(ClientEvent::Publish(
            InboundPublish::new("t", "x", QoS::AtLeastOnce).with_packet_id(1)
        )));
        assert!(relay.push(ClientEvent::Ack(AckRef::new("src", 1))));
        assert_eq!(relay.backlog(), 4);

        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 4);
    }

    // Minimal MQTT 3.1.1 broker side, enough to drive one rumqttc connection

    async fn within<F: Future>(future: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), future)
            .await
            .expect("timed out")
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("tcp://{}", listener.local_addr().unwrap());
        (listener, address)
    }

    fn packet(header: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![header];
        let mut len = body.len();
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if len == 0 {
                break;
            }
        }
        out.extend_from_slice(body);
        out
    }

    fn publish_packet(topic: &str, payload: &[u8], qos: u8, pkid: u16, retain: bool, dup: bool) -> Vec<u8> {
        let header = 0x30 | (dup as u8) << 3 | qos << 1 | retain as u8;
        let mut body = (topic.len() as u16).to_be_bytes().to_vec();
        body.extend_from_slice(topic.as_bytes());
        if qos > 0 {
            body.extend_from_slice(&pkid.to_be_bytes());
        }
        body.extend_from_slice(payload);
        packet(header, &body)
    }

    fn puback_packet(pkid: u16) -> Vec<u8> {
        packet(0x40, &pkid.to_be_bytes())
    }

    fn parse_subscribe(body: &[u8]) -> Vec<(String, u8)> {
        let mut filters = Vec::new();
        let mut i = 2;
        while i < body.len() {
            let len = u16::from_be_bytes([body[i], body[i + 1]]) as usize;
            i += 2;
            let topic = String::from_utf8(body[i..i + len].to_vec()).unwrap();
            i += len;
            filters.push((topic, body[i]));
            i += 1;
        }
        filters
    }

    /// Topic, packet id and payload of a PUBLISH sent by the client
    fn parse_publish(header: u8, body: &[u8]) -> (String, u16, Vec<u8>) {
        let len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let topic = String::from_utf8(body[2..2 + len].to_vec()).unwrap();
        let mut i = 2 + len;
        let mut pkid = 0;
        if (header >> 1) & 0x03 > 0 {
            pkid = u16::from_be_bytes([body[i], body[i + 1]]);
            i += 2;
        }
        (topic, pkid, body[i..].to_vec())
    }

    async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> (u8, Vec<u8>) {
        let header = reader.read_u8().await.unwrap();
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = reader.read_u8().await.unwrap();
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        reader.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    struct Session {
        stream: TcpStream,
    }

    impl Session {
        /// Accept one connection and answer its CONNECT
        async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = listener.accept().await.unwrap();
            let mut session = Self { stream };
            let (header, _) = read_packet(&mut session.stream).await;
            assert_eq!(header >> 4, 1, "expected CONNECT");
            session.write(&[0x20, 0x02, 0x00, 0x00]).await;
            session
        }

        async fn write(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
        }

        /// Next packet of type `kind`, answering SUBSCRIBE and PINGREQ meanwhile
        async fn expect(&mut self, kind: u8) -> (u8, Vec<u8>) {
            loop {
                let (header, body) = read_packet(&mut self.stream).await;
                if header >> 4 == kind {
                    return (header, body);
                }
                match header >> 4 {
                    8 => {
                        let mut ack = body[..2].to_vec();
                        ack.extend(parse_subscribe(&body).iter().map(|(_, qos)| *qos));
                        self.write(&packet(0x90, &ack)).await;
                    }
                    12 => self.write(&[0xD0, 0x00]).await,
                    _ => {}
                }
            }
        }
    }

    fn client_for(address: &str, subscriptions: Vec<Subscription>) -> MqttClient {
        let mut options = ClientOptions::new("test-broker");
        options.subscriptions = subscriptions;
        MqttClient::new("broker", config(address), options).unwrap()
    }

    async fn next_event(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
        within(rx.recv()).await.expect("event channel closed")
    }

    #[tokio::test]
    async fn test_subscribes_on_connack() {
        let (listener, address) = listen().await;
        let client = client_for(
            &address,
            vec![
                Subscription::new("group/+/in", QoS::AtLeastOnce),
                Subscription::new("status", QoS::AtMostOnce),
            ],
        );
        client.start(None).await.unwrap();

        let mut session = within(Session::accept(&listener)).await;
        let (header, body) = within(session.expect(8)).await;
        assert_eq!(header, 0x82);
        assert_eq!(
            parse_subscribe(&body),
            vec![("group/+/in".to_string(), 1), ("status".to_string(), 0)]
        );

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_publish_is_acked_on_request() {
        let (listener, address) = listen().await;
        let client = client_for(&address, Vec::new());
        let (tx, mut rx) = mpsc::channel(8);
        client.start(Some(tx)).await.unwrap();

        let mut session = within(Session::accept(&listener)).await;
        session
            .write(&publish_packet("group/1/in", b"hello", 1, 9, true, true))
            .await;

        match next_event(&mut rx).await {
            ClientEvent::Publish(publish) => {
                assert_eq!(publish.topic, "group/1/in");
                assert_eq!(&publish.payload[..], b"hello");
                assert_eq!(publish.qos, QoS::AtLeastOnce);
                assert_eq!(publish.packet_id, 9);
                assert!(publish.retain);
                assert!(publish.dup);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Manual acks: nothing is acknowledged until asked
        client.send_ack(&AckRef::new("broker", 9)).await.unwrap();
        let (header, body) = within(session.expect(4)).await;
        assert_eq!(header, 0x40);
        assert_eq!(body, 9u16.to_be_bytes().to_vec());

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_puback_releases_matching_origin() {
        let (listener, address) = listen().await;
        let client = client_for(&address, Vec::new());
        let (tx, mut rx) = mpsc::channel(8);
        client.start(Some(tx)).await.unwrap();
        let mut session = within(Session::accept(&listener)).await;

        // Both sources use packet id 7 on their own connections
        for (origin, payload) in [("src-a", "one"), ("src-b", "two")] {
            let mut msg = OutboundMessage::new("out", Bytes::from(payload), ClientRef::default());
            msg.qos = QoS::AtLeastOnce;
            msg.origin = Some(AckRef::new(origin, 7));
            client.send_or_drop(msg).await.unwrap();
        }

        let mut assigned = Vec::new();
        for _ in 0..2 {
            let (header, body) = within(session.expect(3)).await;
            let (topic, pkid, payload) = parse_publish(header, &body);
            assert_eq!(topic, "out");
            assert_eq!(header & 0x06, 0x02);
            assigned.push((String::from_utf8(payload).unwrap(), pkid));
        }
        assert_eq!(assigned[0].0, "one");
        assert_eq!(assigned[1].0, "two");
        assert_ne!(assigned[0].1, assigned[1].1);

        // Acknowledge out of order
        session.write(&puback_packet(assigned[1].1)).await;
        assert!(matches!(
            next_event(&mut rx).await,
            ClientEvent::Ack(ack) if ack == AckRef::new("src-b", 7)
        ));
        session.write(&puback_packet(assigned[0].1)).await;
        assert!(matches!(
            next_event(&mut rx).await,
            ClientEvent::Ack(ack) if ack == AckRef::new("src-a", 7)
        ));

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_sends_disconnect() {
        let (listener, address) = listen().await;
        let client = client_for(&address, Vec::new());
        let (tx, mut rx) = mpsc::channel(8);
        client.start(Some(tx)).await.unwrap();

        let mut session = within(Session::accept(&listener)).await;
        session
            .write(&publish_packet("ping", b"", 0, 0, false, false))
            .await;
        // The CONNACK was handled before this publish
        assert!(matches!(next_event(&mut rx).await, ClientEvent::Publish(_)));

        client.close().await.unwrap();
        let (header, _) = within(session.expect(14)).await;
        assert_eq!(header, 0xE0);
    }

    #[tokio::test]
    async fn test_forwarding_to_own_connection_under_load() {
        const COUNT: usize = 2000;

        let (listener, address) = listen().await;
        let mut cfg = config(&address);
        cfg.inbound_capacity = 4;
        let client = Arc::new(
            MqttClient::new("broker", cfg, ClientOptions::new("test-broker")).unwrap(),
        );
        let (tx, mut rx) = mpsc::channel(4);
        client.start(Some(tx)).await.unwrap();

        // Same shape as a rule whose source and target are this connection
        let forwarder = client.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let ClientEvent::Publish(publish) = event {
                    let msg = OutboundMessage::new("out", publish.payload, ClientRef::default());
                    if forwarder.send_or_drop(msg).await.is_err() {
                        break;
                    }
                }
            }
        });

        let session = within(Session::accept(&listener)).await;
        let (mut reader, mut writer) = session.stream.into_split();

        let write = async {
            for i in 0..COUNT {
                let publish = publish_packet("in", i.to_string().as_bytes(), 0, 0, false, false);
                writer.write_all(&publish).await.unwrap();
            }
        };
        let read = async {
            let mut forwarded = 0;
            while forwarded < COUNT {
                let (header, body) = read_packet(&mut reader).await;
                if header >> 4 == 3 && parse_publish(header, &body).0 == "out" {
                    forwarded += 1;
                }
            }
            forwarded
        };

        let (_, forwarded) = tokio::time::timeout(Duration::from_secs(30), async {
            tokio::join!(write, read)
        })
        .await
        .expect("forwarding stalled");
        assert_eq!(forwarded, COUNT);

        client.close().await.unwrap();
    }
}
