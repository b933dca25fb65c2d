//! API aggregator.
//!
//! Fans one inbound request out to several pipelines concurrently and merges
//! their JSON response bodies into a single response.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → buffer body (≤ maxBodyBytes)
//!     → derive one request per sub-target (method, path, headers, body, deadline)
//!     → spawn one task per sub-target → PipelineSource → sub-pipeline
//!       → read body (≤ maxBodyBytes), all under the deadline
//!     → join all (no fail-fast)
//!     → slot check (partialSucceed)
//!     → merge objects | array of objects, in declaration order
//! ```
//!
//! # Design Decisions
//! - One result slot per sub-target, owned by exactly one task
//! - Output order is declaration order, never completion order
//! - A timed-out sub-call is dropped, which cancels its remaining work
//! - The deadline covers the sub-response body as well as its head
//! - Only a `200` sub-response fills its slot

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderValue, Method, StatusCode, Uri};
use bytes::Bytes;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::time::Instant;

use super::{Filter, FilterContext, FilterError, FilterResult, FilterSpec, Kind};
use crate::adaptor::{HeaderAdaptSpec, HeaderAdaptor, PathAdaptSpec, PathAdaptor};
use crate::config::duration::parse_duration;
use crate::context::{earliest, read_limited, BodyReadError, HttpContext, Request};
use crate::observability::metrics;
use crate::pipeline::PipelineSource;

pub const RESULT_FAILED: &str = "failed";

/// Upper bound of `maxBodyBytes` (10 MiB).
pub const MAX_BODY_BYTES_LIMIT: u64 = 10 * 1024 * 1024;

const DEFAULT_MAX_BODY_BYTES: u64 = 10240;

/// Status returned when a sub-target body is not a JSON object.
pub const STATUS_BAD_RESPONSE: u16 = 599;

/// Header naming the sub-target that failed a non-partial aggregation.
pub const HEADER_AGGREGATOR: &str = "x-eg-aggregator";

pub static KIND: Kind = Kind {
    name: "APIAggregator",
    description: "APIAggregator aggregates APIs.",
    results: &[RESULT_FAILED],
    default_spec: || json!({ "timeout": "60s", "maxBodyBytes": DEFAULT_MAX_BODY_BYTES }),
    validate,
    create_instance,
};

/// One fan-out destination.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubTarget {
    /// Name of the pipeline to call.
    pub name: String,
    /// Method override; the inbound method when absent.
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub path: Option<PathAdaptSpec>,
    #[serde(default)]
    pub header: Option<HeaderAdaptSpec>,
    /// Send the derived request without a body.
    #[serde(default)]
    pub disable_body: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorSpec {
    pub max_body_bytes: u64,
    #[serde(default)]
    pub partial_succeed: bool,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub merge_response: bool,
    pub pipelines: Vec<SubTarget>,
}

/// Compiled sub-target.
#[derive(Debug)]
struct Target {
    spec: SubTarget,
    path: Option<PathAdaptor>,
    header: Option<HeaderAdaptor>,
}

impl Target {
    fn compile(spec: &SubTarget) -> Result<Self, String> {
        let path = spec
            .path
            .as_ref()
            .map(PathAdaptor::new)
            .transpose()
            .map_err(|e| format!("pipeline {:?}: {}", spec.name, e))?;
        let header = spec
            .header
            .as_ref()
            .map(HeaderAdaptor::new)
            .transpose()
            .map_err(|e| format!("pipeline {:?}: {}", spec.name, e))?;
        Ok(Self {
            spec: spec.clone(),
            path,
            header,
        })
    }

    /// Build the derived request for this sub-target.
    fn derive(&self, original: &Request, body: &Bytes) -> Result<Request, String> {
        let method = match &self.spec.method {
            Some(m) if !m.is_empty() => Method::from_bytes(m.as_bytes())
                .map_err(|_| format!("invalid method {:?}", m))?,
            _ => original.method().clone(),
        };

        let uri = match &self.path {
            Some(pa) => {
                let mut parts = original.uri().clone().into_parts();
                let path = pa.adapt(original.path());
                let path_and_query = match original.uri().query() {
                    Some(q) => format!("{}?{}", path, q),
                    None => path,
                };
                parts.path_and_query = Some(
                    path_and_query
                        .parse()
                        .map_err(|e| format!("invalid path {:?}: {}", path_and_query, e))?,
                );
                Uri::from_parts(parts).map_err(|e| e.to_string())?
            }
            None => original.uri().clone(),
        };

        let mut headers = original.headers().clone();
        headers.remove(header::CONTENT_LENGTH);
        if let Some(adaptor) = &self.header {
            adaptor.adapt(&mut headers);
        }

        let mut req = Request::new(method, uri).with_headers(headers);
        if !self.spec.disable_body {
            req.set_body(body.clone());
        }
        Ok(req)
    }
}

/// Failure merging sub-target bodies.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("unmarshal response of {pipeline} to json object failed: {source}")]
    Decode {
        pipeline: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("marshal merged response failed: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Merge JSON object bodies in the given order.
///
/// `merge = true` shallow-merges into one object, later keys winning;
/// otherwise the objects are returned as an array.
pub fn merge_bodies(bodies: &[(&str, Bytes)], merge: bool) -> Result<Vec<u8>, MergeError> {
    let decode = |name: &str, body: &Bytes| {
        serde_json::from_slice::<Map<String, Value>>(body).map_err(|source| MergeError::Decode {
            pipeline: name.to_string(),
            source,
        })
    };

    if merge {
        let mut merged = Map::new();
        for (name, body) in bodies {
            merged.extend(decode(name, body)?);
        }
        serde_json::to_vec(&merged).map_err(MergeError::Encode)
    } else {
        let objects = bodies
            .iter()
            .map(|(name, body)| decode(name, body))
            .collect::<Result<Vec<_>, _>>()?;
        serde_json::to_vec(&objects).map_err(MergeError::Encode)
    }
}

pub struct ApiAggregator {
    spec: FilterSpec,
    max_body_bytes: u64,
    timeout: Option<Duration>,
    partial_succeed: bool,
    merge_response: bool,
    targets: Vec<Target>,
    source: Weak<dyn PipelineSource>,
    handled: AtomicU64,
    failed: AtomicU64,
    closed: AtomicBool,
}

fn compile_targets(typed: &AggregatorSpec) -> Result<Vec<Target>, String> {
    if typed.pipelines.is_empty() {
        return Err("pipelines must not be empty".to_string());
    }
    typed.pipelines.iter().map(Target::compile).collect()
}

fn validate(spec: &FilterSpec) -> Result<(), FilterError> {
    let typed: AggregatorSpec = spec.decode(&KIND)?;
    if typed.max_body_bytes > MAX_BODY_BYTES_LIMIT {
        return Err(FilterError::invalid(
            &spec.name,
            format!("maxBodyBytes must be within [0, {}]", MAX_BODY_BYTES_LIMIT),
        ));
    }
    if let Some(timeout) = typed.timeout.as_deref().filter(|t| !t.is_empty()) {
        parse_duration(timeout).map_err(|e| FilterError::invalid(&spec.name, e))?;
    }
    for target in &typed.pipelines {
        if let Some(m) = target.method.as_deref().filter(|m| !m.is_empty()) {
            Method::from_bytes(m.as_bytes())
                .map_err(|_| FilterError::invalid(&spec.name, format!("invalid method {:?}", m)))?;
        }
    }
    compile_targets(&typed).map_err(|e| FilterError::invalid(&spec.name, e))?;
    Ok(())
}

fn create_instance(spec: FilterSpec, ctx: &FilterContext) -> Result<Arc<dyn Filter>, FilterError> {
    if !ctx.has_source() {
        panic!(
            "BUG: pipeline source not available for {} in pipeline {}",
            spec.name,
            ctx.pipeline()
        );
    }

    let typed: AggregatorSpec = spec.decode(&KIND)?;

    let max_body_bytes = if typed.max_body_bytes > MAX_BODY_BYTES_LIMIT {
        tracing::error!(
            filter = %spec.name,
            max_body_bytes = typed.max_body_bytes,
            "BUG: maxBodyBytes out of range, using default"
        );
        DEFAULT_MAX_BODY_BYTES
    } else {
        typed.max_body_bytes
    };

    let timeout = match typed.timeout.as_deref().filter(|t| !t.is_empty()) {
        Some(t) => match parse_duration(t) {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::error!(filter = %spec.name, error = %e, "BUG: parse timeout failed");
                None
            }
        },
        None => None,
    };

    let targets = compile_targets(&typed).map_err(|e| FilterError::invalid(&spec.name, e))?;

    Ok(Arc::new(ApiAggregator {
        spec,
        max_body_bytes,
        timeout,
        partial_succeed: typed.partial_succeed,
        merge_response: typed.merge_response,
        targets,
        source: ctx.source(),
        handled: AtomicU64::new(0),
        failed: AtomicU64::new(0),
        closed: AtomicBool::new(false),
    }))
}

impl ApiAggregator {
    fn fail(&self, ctx: &mut HttpContext, status: StatusCode, tag: Option<String>) -> FilterResult {
        ctx.response_mut().set_status(status);
        if let Some(tag) = tag {
            ctx.add_tag(tag);
        }
        self.failed.fetch_add(1, Ordering::Relaxed);
        metrics::record_aggregation(&self.spec.name, "failed");
        FilterResult::Named(RESULT_FAILED)
    }

    /// Ceiling applied to sub-target response bodies.
    fn response_limit(&self) -> u64 {
        if self.max_body_bytes == 0 {
            MAX_BODY_BYTES_LIMIT
        } else {
            self.max_body_bytes
        }
    }

    /// Run one sub-call and buffer its body, both under `deadline`.
    async fn call(
        source: Weak<dyn PipelineSource>,
        filter: String,
        name: String,
        req: Request,
        deadline: Option<Instant>,
        limit: u64,
    ) -> Slot {
        let start = std::time::Instant::now();
        let Some(handler) = source.upgrade().and_then(|s| s.get_pipeline(&name)) else {
            tracing::error!(filter = %filter, pipeline = %name, "Pipeline not found");
            return Slot::Failed;
        };

        let work = async {
            let mut sub = HttpContext::new(req);
            sub.set_deadline(deadline);
            handler.handle(&mut sub).await;

            let mut resp = sub.into_response();
            if resp.status() != StatusCode::OK {
                tracing::debug!(
                    filter = %filter,
                    pipeline = %name,
                    status = %resp.status(),
                    "Sub-request did not succeed"
                );
                return Slot::Failed;
            }
            match read_limited(resp.take_body(), limit).await {
                Ok(body) => Slot::Filled(body),
                Err(BodyReadError::TooLarge { limit }) => Slot::TooLarge { limit },
                Err(e) => Slot::Unreadable(e.to_string()),
            }
        };

        let slot = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, work).await {
                Ok(slot) => slot,
                Err(_) => {
                    tracing::warn!(filter = %filter, pipeline = %name, "Sub-request timed out");
                    Slot::Failed
                }
            },
            None => work.await,
        };
        metrics::record_sub_request(&filter, &name, start);
        slot
    }
}

/// Outcome of one sub-call, owned by the task that ran it.
#[derive(Debug)]
enum Slot {
    Filled(Bytes),
    /// Missing pipeline, non-200 status, or deadline exceeded.
    Failed,
    TooLarge { limit: u64 },
    Unreadable(String),
}

#[async_trait]
impl Filter for ApiAggregator {
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
        self.handled.fetch_add(1, Ordering::Relaxed);

        let body = if self.max_body_bytes > 0 {
            match read_limited(ctx.request_mut().take_body(), self.max_body_bytes).await {
                Ok(body) => {
                    ctx.request_mut().set_body(body.clone());
                    body
                }
                Err(BodyReadError::TooLarge { limit }) => {
                    let tag = format!("apiAggregator: request body exceed {}B", limit);
                    return self.fail(ctx, StatusCode::PAYLOAD_TOO_LARGE, Some(tag));
                }
                Err(e) => {
                    let tag = format!("apiAggregator: read request body failed: {}", e);
                    return self.fail(ctx, StatusCode::BAD_REQUEST, Some(tag));
                }
            }
        } else {
            Bytes::new()
        };

        let deadline = earliest(ctx.deadline(), self.timeout.map(|t| Instant::now() + t));

        let mut requests = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            match target.derive(ctx.request(), &body) {
                Ok(req) => requests.push(req),
                Err(e) => {
                    tracing::error!(
                        filter = %self.spec.name,
                        pipeline = %target.spec.name,
                        error = %e,
                        "BUG: new HTTP request failed"
                    );
                    return self.fail(ctx, StatusCode::BAD_REQUEST, None);
                }
            }
        }

        let limit = self.response_limit();
        let tasks = self.targets.iter().zip(requests).map(|(target, req)| {
            tokio::spawn(Self::call(
                self.source.clone(),
                self.spec.name.clone(),
                target.spec.name.clone(),
                req,
                deadline,
                limit,
            ))
        });
        let slots: Vec<Slot> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(slot) => slot,
                Err(e) => {
                    tracing::error!(filter = %self.spec.name, error = %e, "Sub-request task failed");
                    Slot::Failed
                }
            })
            .collect();

        let mut bodies = Vec::with_capacity(slots.len());
        for (target, slot) in self.targets.iter().zip(slots) {
            let name = target.spec.name.as_str();
            match slot {
                Slot::Filled(body) => bodies.push((name, body)),
                Slot::Failed if self.partial_succeed => continue,
                Slot::Failed => {
                    if let Ok(value) = HeaderValue::from_str(&format!("failed-in-{}", name)) {
                        ctx.response_mut().headers_mut().insert(HEADER_AGGREGATOR, value);
                    }
                    return self.fail(ctx, StatusCode::SERVICE_UNAVAILABLE, None);
                }
                Slot::TooLarge { limit } => {
                    let tag = format!("apiAggregator: response body exceed {}B", limit);
                    return self.fail(ctx, StatusCode::INSUFFICIENT_STORAGE, Some(tag));
                }
                Slot::Unreadable(e) => {
                    let tag = format!("apiAggregator: read response body failed: {}", e);
                    return self.fail(ctx, StatusCode::INTERNAL_SERVER_ERROR, Some(tag));
                }
            }
        }

        let merged = match merge_bodies(&bodies, self.merge_response) {
            Ok(merged) => merged,
            Err(e @ MergeError::Decode { .. }) => {
                let status = StatusCode::from_u16(STATUS_BAD_RESPONSE)
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                return self.fail(ctx, status, Some(format!("apiAggregator: {}", e)));
            }
            Err(e) => {
                tracing::error!(filter = %self.spec.name, error = %e, "apiAggregator: marshal failed");
                return self.fail(
                    ctx,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Some(format!("apiAggregator: {}", e)),
                );
            }
        };

        let resp = ctx.response_mut();
        resp.headers_mut().remove(header::CONTENT_LENGTH);
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        resp.set_body(merged);
        metrics::record_aggregation(&self.spec.name, "success");
        FilterResult::Continue
    }

    fn status(&self) -> Value {
        json!({
            "handled": self.handled.load(Ordering::Relaxed),
            "failed": self.failed.load(Ordering::Relaxed),
            "closed": self.closed.load(Ordering::Relaxed),
        })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(filter = %self.spec.name, "Aggregator generation closed");
        }
    }
}
