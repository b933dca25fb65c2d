//! Request model handed to filters.
//!
//! # Responsibilities
//! - Hold method, URI, headers and the (single-consumer) body stream
//! - Carry the peer certificate chain of TLS connections
//! - Build derived requests for fan-out

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Method, Uri};

/// Subject or issuer name of a peer certificate.
///
/// Multi-valued attributes keep every value in presentation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistinguishedName {
    pub country: Vec<String>,
    pub organization: Vec<String>,
    pub organizational_unit: Vec<String>,
    pub locality: Vec<String>,
    pub province: Vec<String>,
    pub street_address: Vec<String>,
    pub postal_code: Vec<String>,
    pub serial_number: String,
    pub common_name: String,
}

/// Already-parsed fields of one peer certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerCertificate {
    pub subject: DistinguishedName,
    pub issuer: DistinguishedName,
}

/// TLS state of the connection a request arrived on.
///
/// Inserted as an `Arc<TlsState>` request extension by the TLS acceptor.
#[derive(Debug, Clone, Default)]
pub struct TlsState {
    /// Peer chain, leaf first.
    pub peer_certificates: Vec<PeerCertificate>,
}

/// An HTTP request as seen by filters.
#[derive(Debug, Default)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
    tls: Option<Arc<TlsState>>,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            ..Self::default()
        }
    }

    /// Convert an inbound axum request, picking up any TLS state extension.
    pub fn from_http(req: axum::http::Request<Body>) -> Self {
        let (parts, body) = req.into_parts();
        let tls = parts.extensions.get::<Arc<TlsState>>().cloned();
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            tls,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_tls(mut self, tls: Arc<TlsState>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn set_uri(&mut self, uri: Uri) {
        self.uri = uri;
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Take the body stream, leaving an empty body behind.
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    pub fn tls(&self) -> Option<&TlsState> {
        self.tls.as_deref()
    }

    /// Convert into an outbound hyper request (used by the Proxy filter).
    pub fn into_http(self, uri: Uri) -> Result<axum::http::Request<Body>, axum::http::Error> {
        let mut builder = axum::http::Request::builder().method(self.method).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = self.headers;
        }
        builder.body(self.body)
    }
}
