//! TLS configuration and certificate loading.

use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;

use crate::config::TlsConfig;

/// Failure loading the listener's TLS material.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("{what} file not found: {path:?}")]
    NotFound { what: &'static str, path: String },

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates in {0:?}")]
    NoCertificates(String),

    #[error("no private key in {0:?}")]
    NoPrivateKey(String),

    #[error("invalid client CA in {path:?}: {source}")]
    ClientCa {
        path: String,
        #[source]
        source: rustls::Error,
    },

    #[error("client certificate verifier: {0}")]
    Verifier(#[from] VerifierBuilderError),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

async fn read_pem(what: &'static str, path: &str) -> Result<Vec<u8>, TlsError> {
    if !Path::new(path).exists() {
        return Err(TlsError::NotFound {
            what,
            path: path.to_string(),
        });
    }
    tokio::fs::read(path).await.map_err(|source| TlsError::Read {
        path: path.to_string(),
        source,
    })
}

fn parse_certs(pem: &[u8], path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_string()));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8], path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|source| TlsError::Read {
            path: path.to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_string()))
}

/// Load the listener's rustls configuration from PEM files.
///
/// With `client_ca_path` set, clients are asked for a certificate chained to
/// that CA; anonymous clients are still accepted unless
/// `require_client_cert` is set.
pub async fn load_tls_config(config: &TlsConfig) -> Result<RustlsConfig, TlsError> {
    let cert_pem = read_pem("Certificate", &config.cert_path).await?;
    let key_pem = read_pem("Private key", &config.key_path).await?;
    let certs = parse_certs(&cert_pem, &config.cert_path)?;
    let key = parse_key(&key_pem, &config.key_path)?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder =
        ServerConfig::builder_with_provider(provider.clone()).with_safe_default_protocol_versions()?;

    let mut server = match &config.client_ca_path {
        Some(path) => {
            let pem = read_pem("Client CA", path).await?;
            let mut roots = RootCertStore::empty();
            for cert in parse_certs(&pem, path)? {
                roots.add(cert).map_err(|source| TlsError::ClientCa {
                    path: path.clone(),
                    source,
                })?;
            }

            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
            let verifier = if config.require_client_cert {
                verifier.build()?
            } else {
                verifier.allow_unauthenticated().build()?
            };
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };
    server.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(server)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

    fn fixture(name: &str) -> String {
        format!("{}/{}", FIXTURES, name)
    }

    fn config(client_ca: Option<&str>) -> TlsConfig {
        TlsConfig {
            cert_path: fixture("server.pem"),
            key_path: fixture("server.key"),
            client_ca_path: client_ca.map(fixture),
            require_client_cert: false,
        }
    }

    #[tokio::test]
    async fn test_missing_files() {
        let err = load_tls_config(&TlsConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
            client_ca_path: None,
            require_client_cert: false,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, TlsError::NotFound { what: "Certificate", .. }));
    }

    #[tokio::test]
    async fn test_loads_with_and_without_client_ca() {
        load_tls_config(&config(None)).await.unwrap();
        load_tls_config(&config(Some("ca.pem"))).await.unwrap();
    }

    #[tokio::test]
    async fn test_key_file_without_key() {
        let mut cfg = config(None);
        cfg.key_path = fixture("ca.pem");
        let err = load_tls_config(&cfg).await.unwrap_err();
        assert!(matches!(err, TlsError::NoPrivateKey(_)));
    }
}
