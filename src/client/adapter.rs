//! Async Send Adapter
//!
//! Gives backends without a native asynchronous pipeline (HTTP targets,
//! message queues, the object store) a uniform submission contract:
//!
//! - a bounded queue accepting outbound messages
//! - a dispatch loop started by `start` that spawns one task per message, so
//!   a slow delivery never holds up the messages queued behind it
//!
//! Submission order is preserved; delivery order is not. Delivery failures
//! are logged and never reported back to the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::{Client, ClientError, EventSender};
use crate::config::{AdapterConfig, ClientKind, SubmitMode};
use crate::message::OutboundMessage;

/// The protocol call performed for one queued message
#[async_trait]
pub trait Deliver: Send + Sync + 'static {
    fn kind(&self) -> ClientKind;

    /// Reject a message at submission time, before it is queued
    fn accept(&self, _msg: &OutboundMessage) -> Result<(), ClientError> {
        Ok(())
    }

    async fn deliver(&self, msg: OutboundMessage) -> Result<(), ClientError>;

    /// Release protocol resources when the adapter closes
    async fn shutdown(&self) {}
}

/// Bounded queue plus concurrent dispatch in front of a [`Deliver`]
pub struct AsyncSendAdapter<D: Deliver> {
    name: String,
    deliver: Arc<D>,
    tx: mpsc::Sender<OutboundMessage>,
    rx: Mutex<Option<mpsc::Receiver<OutboundMessage>>>,
    submit: SubmitMode,
    submit_timeout: Duration,
    cancel: CancellationToken,
    tasks: TaskTracker,
    closed: AtomicBool,
}

impl<D: Deliver> AsyncSendAdapter<D> {
    pub fn new(name: impl Into<String>, deliver: D, config: &AdapterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        Self {
            name: name.into(),
            deliver: Arc::new(deliver),
            tx,
            rx: Mutex::new(Some(rx)),
            submit: config.submit,
            submit_timeout: config.submit_timeout,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Wrapped delivery implementation
    pub fn inner(&self) -> &D {
        &self.deliver
    }

    async fn dispatch_loop(
        name: String,
        deliver: Arc<D>,
        mut rx: mpsc::Receiver<OutboundMessage>,
        cancel: CancellationToken,
        tasks: TaskTracker,
    ) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let deliver = deliver.clone();
            let cancel = cancel.clone();
            let name = name.clone();
            tasks.spawn(async move {
                let topic = msg.topic.clone();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(client = %name, %topic, "Delivery abandoned on close");
                    }
                    result = deliver.deliver(msg) => match result {
                        Ok(()) => debug!(client = %name, %topic, "Message delivered"),
                        Err(e) => error!(client = %name, %topic, "Failed to deliver message: {}", e),
                    },
                }
            });
        }
        debug!(client = %name, "Dispatch loop stopped");
    }
}

#[async_trait]
impl<D: Deliver> Client for AsyncSendAdapter<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ClientKind {
        self.deliver.kind()
    }

    async fn send_or_drop(&self, msg: OutboundMessage) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }
        self.deliver.accept(&msg)?;

        match self.submit {
            SubmitMode::Block => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(ClientError::Closed),
                sent = self.tx.send(msg) => sent.map_err(|_| ClientError::Closed),
            },
            SubmitMode::Timeout => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(ClientError::Closed),
                sent = tokio::time::timeout(self.submit_timeout, self.tx.send(msg)) => match sent {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(ClientError::Closed),
                    Err(_) => Err(ClientError::Timeout),
                },
            },
            SubmitMode::Drop => self.tx.try_send(msg).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ClientError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => ClientError::Closed,
            }),
        }
    }

    async fn start(&self, _events: Option<EventSender>) -> Result<(), ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let rx = self.rx.lock().take().ok_or(ClientError::AlreadyStarted)?;

        tokio::spawn(Self::dispatch_loop(
            self.name.clone(),
            self.deliver.clone(),
            rx,
            self.cancel.clone(),
            self.tasks.clone(),
        ));
        info!(client = %self.name, kind = %self.deliver.kind(), "Client started");
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.deliver.shutdown().await;
        info!(client = %self.name, "Client closed");
        Ok(())
    }
}
