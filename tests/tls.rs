//! TLS listener: client certificates reach CertExtractor.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::{config, start_echo_backend, start_gateway};
use pipeline_gateway::config::{GatewayConfig, TlsConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

fn fixture(name: &str) -> String {
    format!("{}/{}", FIXTURES, name)
}

fn certs(name: &str) -> Vec<CertificateDer<'static>> {
    let pem = std::fs::read(fixture(name)).unwrap();
    rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<_, _>>()
        .unwrap()
}

fn key(name: &str) -> PrivateKeyDer<'static> {
    let pem = std::fs::read(fixture(name)).unwrap();
    rustls_pemfile::private_key(&mut &pem[..]).unwrap().unwrap()
}

fn connector(with_identity: bool) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    for cert in certs("ca.pem") {
        roots.add(cert).unwrap();
    }
    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots);

    let config = if with_identity {
        builder
            .with_client_auth_cert(certs("client.pem"), key("client.key"))
            .unwrap()
    } else {
        builder.with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

/// Send one request over TLS; returns the raw response, lowercased.
async fn fetch(connector: TlsConnector, addr: SocketAddr) -> String {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    let mut tls = connector.connect(name, tcp).await.unwrap();
    tls.write_all(b"GET /whoami HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    // The server may close without close_notify; keep what arrived.
    let _ = tls.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).to_lowercase()
}

fn tls_gateway(backend: SocketAddr) -> GatewayConfig {
    let mut cfg = config(&format!(
        r#"
        [[routes]]
        name = "whoami"
        pipeline = "whoami"

        [[pipelines]]
        name = "whoami"
        [[pipelines.filters]]
        name = "org"
        kind = "CertExtractor"
        certIndex = 0
        target = "subject"
        field = "Organization"
        [[pipelines.filters]]
        name = "issuer"
        kind = "CertExtractor"
        certIndex = -1
        target = "issuer"
        field = "CommonName"
        headerKey = "x-client-issuer"
        [[pipelines.filters]]
        name = "proxy"
        kind = "Proxy"
        servers = ["http://{}"]
        "#,
        backend
    ));
    cfg.listener.tls = Some(TlsConfig {
        cert_path: fixture("server.pem"),
        key_path: fixture("server.key"),
        client_ca_path: Some(fixture("ca.pem")),
        require_client_cert: false,
    });
    cfg
}

#[tokio::test]
async fn test_client_certificate_fields_reach_backend() {
    let backend = SocketAddr::from(([127, 0, 0, 1], 38301));
    start_echo_backend(backend).await;
    let gateway = start_gateway(SocketAddr::from(([127, 0, 0, 1], 38300)), tls_gateway(backend)).await;

    let response = fetch(connector(true), gateway.addr).await;
    assert!(response.starts_with("http/1.1 200"), "{}", response);
    assert!(response.contains("tls-subject-organization: acme widgets"), "{}", response);
    assert!(response.contains("x-client-issuer: gateway test root"), "{}", response);

    gateway.shutdown.trigger();
}

#[tokio::test]
async fn test_anonymous_client_is_served_without_headers() {
    let backend = SocketAddr::from(([127, 0, 0, 1], 38311));
    start_echo_backend(backend).await;
    let gateway = start_gateway(SocketAddr::from(([127, 0, 0, 1], 38310)), tls_gateway(backend)).await;

    let response = fetch(connector(false), gateway.addr).await;
    assert!(response.starts_with("http/1.1 200"), "{}", response);
    assert!(!response.contains("tls-subject-organization"), "{}", response);

    gateway.shutdown.trigger();
}
