//! TLS material loading
//!
//! Reads PEM files named in a [`Certificate`] section. Outbound backends get
//! raw PEM bytes (their libraries parse them); the HTTP ingress gets a ready
//! `TlsAcceptor`.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::config::Certificate;

/// Error type for TLS configuration
#[derive(Debug)]
pub enum TlsError {
    /// IO error reading files
    Io { path: String, source: std::io::Error },
    /// Certificate parsing error
    CertificateError(String),
    /// Private key error
    PrivateKeyError(String),
    /// TLS configuration error
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io { path, source } => write!(f, "IO error reading {}: {}", path, source),
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKeyError(msg) => write!(f, "Private key error: {}", msg),
            TlsError::ConfigError(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TlsError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn open(path: &str) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })
}

/// Read a PEM file as raw bytes
pub fn read_pem(path: &str) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Io {
        path: path.to_string(),
        source,
    })
}

/// Client identity (certificate + key) as PEM bytes, when both are set
pub fn client_identity(cert: &Certificate) -> Result<Option<(Vec<u8>, Vec<u8>)>, TlsError> {
    match (&cert.cert, &cert.key) {
        (Some(cert), Some(key)) => Ok(Some((read_pem(cert)?, read_pem(key)?))),
        (None, None) => Ok(None),
        _ => Err(TlsError::ConfigError(
            "cert and key must be configured together".to_string(),
        )),
    }
}

/// Load certificates from a PEM file
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(format!(
            "No certificates found in {}",
            path
        )));
    }

    Ok(certs)
}

/// Load private key from a PEM file
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_reader(open(path)?)
        .map_err(|e| TlsError::PrivateKeyError(format!("Failed to parse private key: {}", e)))
}

/// Load CA certificates into a root store
fn load_ca_certs(path: &str) -> Result<RootCertStore, TlsError> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs(path)? {
        root_store.add(cert).map_err(|e| {
            TlsError::CertificateError(format!("Failed to add CA certificate: {}", e))
        })?;
    }
    Ok(root_store)
}

/// Build a server acceptor from `cert`/`key`.
///
/// Returns `None` when neither is configured (plain HTTP). A configured `ca`
/// requires callers to present a certificate signed by it.
pub fn server_acceptor(config: &Certificate) -> Result<Option<TlsAcceptor>, TlsError> {
    let (cert_path, key_path) = match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => (cert, key),
        (None, None) => return Ok(None),
        _ => {
            return Err(TlsError::ConfigError(
                "cert and key must be configured together".to_string(),
            ))
        }
    };

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let server_config = match &config.ca {
        Some(ca_path) => {
            let root_store = load_ca_certs(ca_path)?;
            let client_verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
                .build()
                .map_err(|e| {
                    TlsError::ConfigError(format!("Failed to build client verifier: {}", e))
                })?;

            ServerConfig::builder()
                .with_client_cert_verifier(client_verifier)
                .with_single_cert(certs, key)
        }
        None => ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key),
    }
    .map_err(|e| TlsError::ConfigError(format!("Failed to build TLS config: {}", e)))?;

    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_certificate_means_plain() {
        assert!(server_acceptor(&Certificate::default()).unwrap().is_none());
        assert!(client_identity(&Certificate::default()).unwrap().is_none());
    }

    #[test]
    fn test_cert_without_key_is_rejected() {
        let cert = Certificate {
            cert: Some("/tmp/server.pem".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            server_acceptor(&cert),
            Err(TlsError::ConfigError(_))
        ));
        assert!(matches!(
            client_identity(&cert),
            Err(TlsError::ConfigError(_))
        ));
    }

    #[test]
    fn test_missing_file_names_path() {
        let err = read_pem("/nonexistent/ca.pem").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn test_empty_pem_has_no_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "").unwrap();

        let err = load_certs(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, TlsError::CertificateError(_)));
    }
}
