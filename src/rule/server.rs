//! HTTP ingress
//!
//! Rules whose source is the `http-server` client are triggered by
//! `POST /rules/{name}`. The request body runs through the same
//! function-then-forward pipeline as broker messages; the HTTP response takes
//! the place of the acknowledgment.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::pipeline::{Outcome, Pipeline};
use crate::config::{HttpServerConfig, RuleInfo};
use crate::message::{InboundPublish, QoS};

const RULES_PREFIX: &str = "/rules/";

/// Failure answered to an ingress caller
#[derive(Debug)]
pub enum IngressError {
    /// Unknown rule name
    RequestParamInvalid(String),
    FunctionCallFailed(String),
    TargetSendFailed(String),
    NotFound,
    MethodNotAllowed,
}

impl IngressError {
    pub fn status(&self) -> StatusCode {
        match self {
            IngressError::RequestParamInvalid(_) => StatusCode::BAD_REQUEST,
            IngressError::FunctionCallFailed(_) | IngressError::TargetSendFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            IngressError::NotFound => StatusCode::NOT_FOUND,
            IngressError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            IngressError::RequestParamInvalid(_) => "RequestParamInvalid",
            IngressError::FunctionCallFailed(_) => "FunctionCallFailed",
            IngressError::TargetSendFailed(_) => "TargetSendFailed",
            IngressError::NotFound => "NotFound",
            IngressError::MethodNotAllowed => "MethodNotAllowed",
        }
    }
}

impl fmt::Display for IngressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngressError::RequestParamInvalid(msg)
            | IngressError::FunctionCallFailed(msg)
            | IngressError::TargetSendFailed(msg) => write!(f, "{}", msg),
            IngressError::NotFound => write!(f, "route not found"),
            IngressError::MethodNotAllowed => write!(f, "method not allowed"),
        }
    }
}

impl std::error::Error for IngressError {}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(err: &IngressError) -> Response<Full<Bytes>> {
    json_response(
        err.status(),
        json!({ "code": err.code(), "message": err.to_string() }),
    )
}

pub struct IngressServer {
    name: String,
    addr: String,
    read_timeout: Duration,
    rules: HashMap<String, RuleInfo>,
    pipeline: Arc<Pipeline>,
    acceptor: Option<TlsAcceptor>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl IngressServer {
    pub fn new(
        name: impl Into<String>,
        config: &HttpServerConfig,
        rules: HashMap<String, RuleInfo>,
        pipeline: Arc<Pipeline>,
        acceptor: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            name: name.into(),
            addr: format!("{}:{}", config.host, config.port),
            read_timeout: config.read_timeout,
            rules,
            pipeline,
            acceptor,
            local_addr: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &HashMap<String, RuleInfo> {
        &self.rules
    }

    /// Bound address, once serving
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Answer one request
    pub async fn handle(&self, method: &Method, path: &str, body: Bytes) -> Response<Full<Bytes>> {
        match self.route(method, path, body).await {
            Ok(()) => json_response(StatusCode::OK, json!({ "success": true })),
            Err(e) => {
                error!(server = %self.name, path, "Ingress request failed: {}", e);
                error_response(&e)
            }
        }
    }

    async fn route(&self, method: &Method, path: &str, body: Bytes) -> Result<(), IngressError> {
        let name = path
            .strip_prefix(RULES_PREFIX)
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .ok_or(IngressError::NotFound)?;

        if method != Method::POST {
            return Err(IngressError::MethodNotAllowed);
        }

        let rule = self.rules.get(name).ok_or_else(|| {
            IngressError::RequestParamInvalid(format!("rule name ({}) not found", name))
        })?;

        self.pipeline.metrics().received(&self.name);
        let publish = InboundPublish::new("", body, QoS::AtMostOnce);

        match self.pipeline.process(rule, &publish, None).await {
            Outcome::TransformFailed(e) => Err(IngressError::FunctionCallFailed(e.to_string())),
            Outcome::ForwardFailed(e) => Err(IngressError::TargetSendFailed(e.to_string())),
            Outcome::Filtered | Outcome::Forwarded | Outcome::Deferred => Ok(()),
        }
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        info!(
            server = %self.name,
            rules = self.rules.len(),
            tls = self.acceptor.is_some(),
            "Ingress listening on {}",
            local
        );
        Ok(listener)
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
        tasks: TaskTracker,
    ) {
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(server = %self.name, "Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };
            debug!(server = %self.name, %peer, "Ingress connection");

            let server = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                match server.acceptor.clone() {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls) => server.serve_connection(tls, shutdown).await,
                        Err(e) => debug!(%peer, "TLS handshake failed: {}", e),
                    },
                    None => server.serve_connection(stream, shutdown).await,
                }
            });
        }
        info!(server = %self.name, "Ingress stopped");
    }

    async fn serve_connection<I>(self: Arc<Self>, io: I, shutdown: CancellationToken)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server = self.clone();
        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let server = server.clone();
            async move {
                let method = req.method().clone();
                let path = req.uri().path().to_string();
                let response = match req.into_body().collect().await {
                    Ok(body) => server.handle(&method, &path, body.to_bytes()).await,
                    Err(e) => error_response(&IngressError::RequestParamInvalid(format!(
                        "failed to read body: {}",
                        e
                    ))),
                };
                Ok::<_, Infallible>(response)
            }
        });

        let conn = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(self.read_timeout)
            .serve_connection(TokioIo::new(io), service);
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(server = %self.name, "Ingress connection error: {}", e);
                }
            }
            _ = shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                let _ = conn.await;
            }
        }
    }
}
