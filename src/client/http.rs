//! HTTP target backend
//!
//! Each message becomes one request `{method} {address}{topic}` with a JSON
//! content type. Responses outside 200..=208 count as failed deliveries.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use tracing::debug;

use super::adapter::Deliver;
use super::tls;
use super::ClientError;
use crate::config::{ClientKind, HttpClientConfig};
use crate::message::OutboundMessage;

pub struct HttpDeliver {
    client: reqwest::Client,
    address: String,
}

impl HttpDeliver {
    pub fn new(config: HttpClientConfig) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);

        if let Some(ref ca) = config.tls.ca {
            let pem = tls::read_pem(ca)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ClientError::InvalidConfig(format!("invalid ca {}: {}", ca, e)))?;
            builder = builder.add_root_certificate(cert);
        }
        if let Some((mut cert, key)) = tls::client_identity(&config.tls)? {
            cert.push(b'\n');
            cert.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&cert)
                .map_err(|e| ClientError::InvalidConfig(format!("invalid client identity: {}", e)))?;
            builder = builder.identity(identity);
        }
        if config.tls.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            client,
            address: config.address.trim_end_matches('/').to_string(),
        })
    }

    /// Request target for a rewritten topic or path
    pub fn url(&self, topic: &str) -> String {
        if topic.is_empty() || topic.starts_with('/') {
            format!("{}{}", self.address, topic)
        } else {
            format!("{}/{}", self.address, topic)
        }
    }
}

/// Parse the rule's method, defaulting to POST when unset
fn method(name: &str) -> Result<Method, ClientError> {
    if name.is_empty() {
        return Ok(Method::POST);
    }
    Method::from_bytes(name.to_ascii_uppercase().as_bytes())
        .map_err(|_| ClientError::InvalidMessage(format!("invalid http method '{}'", name)))
}

fn is_success(status: u16) -> bool {
    (200..=208).contains(&status)
}

#[async_trait]
impl Deliver for HttpDeliver {
    fn kind(&self) -> ClientKind {
        ClientKind::Http
    }

    fn accept(&self, msg: &OutboundMessage) -> Result<(), ClientError> {
        method(&msg.target.method).map(|_| ())
    }

    async fn deliver(&self, msg: OutboundMessage) -> Result<(), ClientError> {
        let url = self.url(&msg.topic);
        let response = self
            .client
            .request(method(&msg.target.method)?, &url)
            .header(CONTENT_TYPE, "application/json")
            .body(msg.payload)
            .send()
            .await
            .map_err(|e| ClientError::Send(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !is_success(status.as_u16()) {
            return Err(ClientError::Send(format!("{}: unexpected status {}", url, status)));
        }

        debug!(%url, %status, "HTTP message sent");
        Ok(())
    }
}
