//! Proxy: forwards the request to a backend server.
//!
//! # Responsibilities
//! - Rotate through configured servers (round-robin)
//! - Forward method, path, query, headers and body
//! - Enforce a per-request timeout
//! - Answer with the fallback mock when the backend cannot be reached
//!
//! # Design Decisions
//! - Response bodies are streamed, not buffered
//! - No retries; a failed forward is reported through the filter result

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{header, StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::fallback::{Fallback, FallbackSpec};
use super::{Filter, FilterContext, FilterError, FilterResult, FilterSpec, Kind};
use crate::config::duration::parse_duration;
use crate::context::{earliest, HttpContext};
use crate::observability::metrics;

pub const RESULT_FALLBACK: &str = "fallback";
pub const RESULT_SERVER_ERROR: &str = "serverError";

pub static KIND: Kind = Kind {
    name: "Proxy",
    description: "Proxy forwards requests to backend servers.",
    results: &[RESULT_FALLBACK, RESULT_SERVER_ERROR],
    default_spec: || json!({}),
    validate,
    create_instance,
};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    /// Base URLs, e.g. `http://127.0.0.1:9095`.
    pub servers: Vec<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub fallback: Option<FallbackSpec>,
}

/// A parsed backend base URL.
#[derive(Debug, Clone)]
struct Server {
    scheme: Scheme,
    authority: Authority,
}

impl Server {
    fn parse(url: &str) -> Result<Self, String> {
        let uri: Uri = url.parse().map_err(|e| format!("invalid server {:?}: {}", url, e))?;
        let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
        if scheme != Scheme::HTTP {
            return Err(format!("server {:?}: only http is supported", url));
        }
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| format!("server {:?} has no host", url))?;
        Ok(Self { scheme, authority })
    }

    fn uri_for(&self, path_and_query: Option<&PathAndQuery>) -> Result<Uri, axum::http::Error> {
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query.map(|p| p.as_str()).unwrap_or("/"))
            .build()
    }
}

struct Compiled {
    servers: Vec<Server>,
    timeout: Option<Duration>,
    fallback: Option<Fallback>,
}

fn compile(spec: &FilterSpec) -> Result<Compiled, FilterError> {
    let typed: ProxySpec = spec.decode(&KIND)?;
    if typed.servers.is_empty() {
        return Err(FilterError::invalid(&spec.name, "servers must not be empty"));
    }
    let servers = typed
        .servers
        .iter()
        .map(|s| Server::parse(s))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| FilterError::invalid(&spec.name, e))?;
    let timeout = typed
        .timeout
        .as_deref()
        .filter(|t| !t.is_empty())
        .map(parse_duration)
        .transpose()
        .map_err(|e| FilterError::invalid(&spec.name, e))?;
    let fallback = typed
        .fallback
        .as_ref()
        .map(Fallback::new)
        .transpose()
        .map_err(|e| FilterError::invalid(&spec.name, e))?;
    Ok(Compiled {
        servers,
        timeout,
        fallback,
    })
}

fn validate(spec: &FilterSpec) -> Result<(), FilterError> {
    compile(spec).map(|_| ())
}

fn create_instance(spec: FilterSpec, _ctx: &FilterContext) -> Result<Arc<dyn Filter>, FilterError> {
    let compiled = compile(&spec)?;
    let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
    Ok(Arc::new(Proxy {
        spec,
        compiled,
        client,
        counter: AtomicUsize::new(0),
        errors: AtomicU64::new(0),
    }))
}

pub struct Proxy {
    spec: FilterSpec,
    compiled: Compiled,
    client: Client<HttpConnector, Body>,
    counter: AtomicUsize,
    errors: AtomicU64,
}

impl Proxy {
    fn next_server(&self) -> &Server {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.compiled.servers.len();
        &self.compiled.servers[index]
    }

    fn failed(&self, ctx: &mut HttpContext, status: StatusCode, tag: String) -> FilterResult {
        self.errors.fetch_add(1, Ordering::Relaxed);
        ctx.add_tag(tag);
        match &self.compiled.fallback {
            Some(fallback) => {
                fallback.fallback(ctx.response_mut());
                FilterResult::Named(RESULT_FALLBACK)
            }
            None => {
                ctx.response_mut().set_status(status);
                FilterResult::Named(RESULT_SERVER_ERROR)
            }
        }
    }
}

#[async_trait]
impl Filter for Proxy {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn kind(&self) -> &'static Kind {
        &KIND
    }

    fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    async fn handle(&self, ctx: &mut HttpContext) -> FilterResult {
        let start = Instant::now();
        let server = self.next_server();
        let uri = match server.uri_for(ctx.request().uri().path_and_query()) {
            Ok(uri) => uri,
            Err(e) => {
                return self.failed(ctx, StatusCode::BAD_REQUEST, format!("proxy: build uri failed: {}", e));
            }
        };

        let mut req = std::mem::take(ctx.request_mut());
        req.headers_mut().remove(header::HOST);
        let req = match req.into_http(uri) {
            Ok(req) => req,
            Err(e) => {
                return self.failed(ctx, StatusCode::BAD_REQUEST, format!("proxy: build request failed: {}", e));
            }
        };

        let deadline = earliest(
            ctx.deadline(),
            self.compiled.timeout.map(|t| tokio::time::Instant::now() + t),
        );
        let forwarded = self.client.request(req);
        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, forwarded).await {
                Ok(outcome) => Some(outcome),
                Err(_) => None,
            },
            None => Some(forwarded.await),
        };

        let backend = server.authority.as_str();
        match outcome {
            Some(Ok(response)) => {
                metrics::record_upstream(backend, response.status().as_u16(), start);
                let (parts, body) = response.into_parts();
                let resp = ctx.response_mut();
                resp.set_status(parts.status);
                resp.set_headers(parts.headers);
                resp.set_body(Body::new(body));
                FilterResult::Continue
            }
            Some(Err(e)) => {
                tracing::error!(filter = %self.spec.name, backend = %backend, error = %e, "Upstream error");
                metrics::record_upstream(backend, 502, start);
                self.failed(ctx, StatusCode::BAD_GATEWAY, format!("proxy: upstream {} failed: {}", backend, e))
            }
            None => {
                tracing::warn!(filter = %self.spec.name, backend = %backend, "Upstream timed out");
                metrics::record_upstream(backend, 504, start);
                self.failed(ctx, StatusCode::GATEWAY_TIMEOUT, format!("proxy: upstream {} timed out", backend))
            }
        }
    }

    fn status(&self) -> Value {
        json!({
            "servers": self.compiled.servers.len(),
            "errors": self.errors.load(Ordering::Relaxed),
        })
    }

    fn close(&self) {}
}
