//! Function invocation
//!
//! Rules may pass the payload through a named function before forwarding it.
//! Functions live in an external service; a call to function `f` is
//! `POST {address}/{f}` with the payload as body, and the response body is
//! the transformed payload.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::config::FunctionConfig;

/// Error type for function calls
#[derive(Debug)]
pub enum FunctionError {
    /// Request could not be sent or the response not read
    Transport(String),
    /// Service answered with a non-200 status
    Status { code: u16, body: String },
    /// No function service configured, or the client could not be built
    InvalidConfig(String),
}

impl fmt::Display for FunctionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionError::Transport(msg) => write!(f, "Function transport error: {}", msg),
            FunctionError::Status { code, body } => write!(f, "[{}] {}", code, body),
            FunctionError::InvalidConfig(msg) => write!(f, "Function config error: {}", msg),
        }
    }
}

impl std::error::Error for FunctionError {}

/// Synchronous request/response transform
#[async_trait]
pub trait FunctionCaller: Send + Sync {
    async fn call(&self, name: &str, payload: Bytes) -> Result<Bytes, FunctionError>;
}

/// Function service reached over HTTP
pub struct HttpFunctionClient {
    client: reqwest::Client,
    address: Option<String>,
}

impl HttpFunctionClient {
    pub fn new(config: &FunctionConfig) -> Result<Self, FunctionError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| FunctionError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            client,
            address: config
                .address
                .as_deref()
                .map(|a| a.trim_end_matches('/').to_string()),
        })
    }

    pub fn url(&self, name: &str) -> Result<String, FunctionError> {
        let address = self.address.as_deref().ok_or_else(|| {
            FunctionError::InvalidConfig(format!(
                "function '{}' requested but function.address is not set",
                name
            ))
        })?;
        Ok(format!("{}/{}", address, name))
    }
}

#[async_trait]
impl FunctionCaller for HttpFunctionClient {
    async fn call(&self, name: &str, payload: Bytes) -> Result<Bytes, FunctionError> {
        let url = self.url(name)?;
        let response = self
            .client
            .post(&url)
            .body(payload)
            .send()
            .await
            .map_err(|e| FunctionError::Transport(format!("{}: {}", url, e)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| FunctionError::Transport(format!("{}: {}", url, e)))?;

        if status != reqwest::StatusCode::OK {
            return Err(FunctionError::Status {
                code: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        debug!(function = name, len = body.len(), "Function returned");
        Ok(body)
    }
}
