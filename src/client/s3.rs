//! Object store target backend
//!
//! Messages are upload events (`{"time", "type", "content": {"remotePath",
//! "localPath"}}`); each delivery uploads the local file to the remote key.
//! Keys that already exist are skipped, so a redelivered event is harmless.
//!
//! Credentials are either static (`ak`/`sk`) or delegated: without static
//! keys the client asks `sts_address` for short-lived credentials and renews
//! them once they expire. Delegated uploads are placed under
//! `{namespace}/{nodeName}/`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::adapter::Deliver;
use super::ClientError;
use crate::config::{ClientKind, S3ClientConfig};
use crate::message::OutboundMessage;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const STS_PATH: &str = "/agent/sts";

/// Upload request carried in the message payload
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, rename = "type")]
    pub kind: String,
    pub content: UploadEvent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvent {
    pub remote_path: String,
    pub local_path: String,
}

/// Parse and check an upload event
pub fn parse_event(payload: &[u8]) -> Result<Event, ClientError> {
    let event: Event = serde_json::from_slice(payload)
        .map_err(|_| ClientError::InvalidMessage("Unexpected message content".to_string()))?;
    if event.content.remote_path.is_empty() || event.content.local_path.is_empty() {
        return Err(ClientError::InvalidMessage(
            "Unexpected message content".to_string(),
        ));
    }
    Ok(event)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StsRequest<'a> {
    sts_type: &'a str,
}

/// Delegated credentials
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StsResponse {
    pub ak: String,
    pub sk: String,
    #[serde(default)]
    pub token: String,
    pub endpoint: String,
    pub bucket: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub node_name: String,
    pub expiration: DateTime<Utc>,
}

impl StsResponse {
    fn prefix(&self) -> String {
        format!("{}/{}", self.namespace, self.node_name)
    }
}

/// Store handle plus where uploads go
struct Session {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: Option<String>,
    /// `None` for static credentials
    expires: Option<DateTime<Utc>>,
}

impl Session {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires.map_or(true, |deadline| deadline > now)
    }

    fn key(&self, remote_path: &str) -> Path {
        match &self.prefix {
            Some(prefix) => Path::from(format!("{}/{}", prefix, remote_path)),
            None => Path::from(remote_path),
        }
    }
}

fn build_store(
    endpoint: Option<&str>,
    region: &str,
    bucket: &str,
    ak: &str,
    sk: &str,
    token: Option<&str>,
) -> Result<Arc<dyn ObjectStore>, ClientError> {
    let mut builder = AmazonS3Builder::new()
        .with_region(region)
        .with_bucket_name(bucket)
        .with_access_key_id(ak)
        .with_secret_access_key(sk)
        .with_virtual_hosted_style_request(false);

    if let Some(endpoint) = endpoint.filter(|e| !e.is_empty()) {
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(!endpoint.starts_with("https"));
    }
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        builder = builder.with_token(token);
    }

    let store = builder
        .build()
        .map_err(|e| ClientError::InvalidConfig(format!("object store: {}", e)))?;
    Ok(Arc::new(store))
}

enum Credentials {
    Static,
    Delegated {
        http: reqwest::Client,
        sts_url: String,
    },
}

pub struct S3Deliver {
    credentials: Credentials,
    session: Mutex<Option<Session>>,
}

impl S3Deliver {
    pub fn new(config: S3ClientConfig) -> Result<Self, ClientError> {
        let ak = config.ak.clone().unwrap_or_default();
        let sk = config.sk.clone().unwrap_or_default();

        if ak.is_empty() && sk.is_empty() {
            let sts_address = config.sts_address.clone().ok_or_else(|| {
                ClientError::InvalidConfig(
                    "s3 client needs either ak/sk or sts_address".to_string(),
                )
            })?;
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;
            return Ok(Self {
                credentials: Credentials::Delegated {
                    http,
                    sts_url: format!("{}{}", sts_address.trim_end_matches('/'), STS_PATH),
                },
                session: Mutex::new(None),
            });
        }

        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| ClientError::InvalidConfig("s3 bucket is required".to_string()))?;
        let store = build_store(
            config.address.as_deref(),
            &config.region,
            &bucket,
            &ak,
            &sk,
            config.token.as_deref(),
        )?;
        Ok(Self::with_store(store, bucket))
    }

    /// Static session over an existing store
    pub fn with_store(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::Static,
            session: Mutex::new(Some(Session {
                store,
                bucket: bucket.into(),
                prefix: None,
                expires: None,
            })),
        }
    }

    async fn fetch_sts(http: &reqwest::Client, url: &str) -> Result<StsResponse, ClientError> {
        let response = http
            .post(url)
            .json(&StsRequest { sts_type: "minio" })
            .send()
            .await
            .map_err(|e| ClientError::Connection(format!("sts request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Connection(format!(
                "sts request failed with status {}",
                status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::Connection(format!("invalid sts response: {}", e)))
    }

    /// Current store, bucket and key for `remote_path`, renewing delegated
    /// credentials when they have expired
    async fn target(
        &self,
        remote_path: &str,
    ) -> Result<(Arc<dyn ObjectStore>, String, Path), ClientError> {
        let mut session = self.session.lock().await;

        let valid = session.as_ref().is_some_and(|s| s.is_valid(Utc::now()));
        if !valid {
            if let Credentials::Delegated { http, sts_url } = &self.credentials {
                let sts = Self::fetch_sts(http, sts_url).await?;
                debug!(endpoint = %sts.endpoint, expiration = %sts.expiration, "Refreshed object store credentials");
                let store = build_store(
                    Some(&sts.endpoint),
                    "us-east-1",
                    &sts.bucket,
                    &sts.ak,
                    &sts.sk,
                    Some(&sts.token),
                )?;
                *session = Some(Session {
                    store,
                    bucket: sts.bucket.clone(),
                    prefix: Some(sts.prefix()),
                    expires: Some(sts.expiration),
                });
            }
        }

        let session = session.as_ref().ok_or(ClientError::Closed)?;
        Ok((
            session.store.clone(),
            session.bucket.clone(),
            session.key(remote_path),
        ))
    }

    async fn upload(&self, event: UploadEvent) -> Result<(), ClientError> {
        let (store, bucket, key) = self.target(&event.remote_path).await?;

        match store.head(&key).await {
            Ok(_) => {
                warn!(%bucket, remote = %key, "File exists, skipping upload");
                return Ok(());
            }
            Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => debug!(remote = %key, "Head object failed, uploading anyway: {}", e),
        }

        let data = tokio::fs::read(&event.local_path).await.map_err(|e| {
            ClientError::Send(format!("cannot read {}: {}", event.local_path, e))
        })?;

        tokio::time::timeout(UPLOAD_TIMEOUT, store.put(&key, PutPayload::from(data)))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::Send(e.to_string()))?;

        debug!(%bucket, remote = %key, local = %event.local_path, "File uploaded");
        Ok(())
    }
}

#[async_trait]
impl Deliver for S3Deliver {
    fn kind(&self) -> ClientKind {
        ClientKind::S3
    }

    fn accept(&self, msg: &OutboundMessage) -> Result<(), ClientError> {
        parse_event(&msg.payload).map(|_| ())
    }

    async fn deliver(&self, msg: OutboundMessage) -> Result<(), ClientError> {
        let event = parse_event(&msg.payload)?;
        self.upload(event.content).await
    }
}
