//! TLS acceptor exposing the client certificate chain to filters.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower_http::add_extension::AddExtension;
use x509_parser::x509::X509Name;

use crate::context::{DistinguishedName, PeerCertificate, TlsState};

/// Runs the rustls handshake, then attaches the connection's
/// `Arc<TlsState>` to every request served on it.
#[derive(Clone)]
pub struct PeerCertAcceptor {
    inner: RustlsAcceptor,
}

impl PeerCertAcceptor {
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config),
        }
    }
}

impl<I, S> Accept<I, S> for PeerCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, Arc<TlsState>>;
    type Future = Pin<Box<dyn Future<Output = io::Result<(Self::Stream, Self::Service)>> + Send>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = inner.accept(stream, service).await?;
            let chain = stream.get_ref().1.peer_certificates().unwrap_or_default();
            let state = Arc::new(tls_state(chain));
            tracing::debug!(peer_certificates = state.peer_certificates.len(), "TLS handshake complete");
            Ok((stream, AddExtension::new(service, state)))
        })
    }
}

/// Parse a verified peer chain, leaf first.
///
/// A certificate that cannot be parsed keeps its position with empty names.
pub fn tls_state(chain: &[CertificateDer<'_>]) -> TlsState {
    TlsState {
        peer_certificates: chain.iter().map(|der| peer_certificate(der)).collect(),
    }
}

fn peer_certificate(der: &[u8]) -> PeerCertificate {
    match x509_parser::parse_x509_certificate(der) {
        Ok((_, cert)) => PeerCertificate {
            subject: distinguished_name(cert.subject()),
            issuer: distinguished_name(cert.issuer()),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse peer certificate");
            PeerCertificate::default()
        }
    }
}

fn distinguished_name(name: &X509Name<'_>) -> DistinguishedName {
    let mut dn = DistinguishedName::default();
    for attr in name.iter_attributes() {
        let Ok(value) = attr.as_str() else {
            continue;
        };
        let value = value.to_string();
        match attr.attr_type().to_id_string().as_str() {
            "2.5.4.6" => dn.country.push(value),
            "2.5.4.10" => dn.organization.push(value),
            "2.5.4.11" => dn.organizational_unit.push(value),
            "2.5.4.7" => dn.locality.push(value),
            "2.5.4.8" => dn.province.push(value),
            "2.5.4.9" => dn.street_address.push(value),
            "2.5.4.17" => dn.postal_code.push(value),
            "2.5.4.5" => dn.serial_number = value,
            "2.5.4.3" => dn.common_name = value,
            _ => {}
        }
    }
    dn
}
