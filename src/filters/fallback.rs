//! Fallback responder.
//!
//! Replaces the response with a pre-rendered mock: status, headers, body.
//! Used as a filter of its own and by the Proxy filter when a backend fails.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Filter, FilterContext, FilterError, FilterResult, FilterSpec, Kind};
use crate::context::{HttpContext, Response};

pub static KIND: Kind = Kind {
    name: "Fallback",
    description: "Fallback replaces the response with a configured mock response.",
    results: &[],
    default_spec: || json!({ "mockCode": 200 }),
    validate,
    create_instance,
};

/// Mock response definition.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FallbackSpec {
    pub mock_code: u16,
    #[serde(default)]
    pub mock_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub mock_body: String,
}

/// Pre-rendered mock response; immutable after construction.
#[derive(Debug, Clone)]
pub struct Fallback {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    body_length: HeaderValue,
}

impl Fallback {
    pub fn new(spec: &FallbackSpec) -> Result<Self, String> {
        let status = StatusCode::from_u16(spec.mock_code)
            .map_err(|_| format!("invalid mockCode {}", spec.mock_code))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &spec.mock_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| format!("invalid mock header name {:?}", name))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| format!("invalid value for mock header {:?}", name))?;
            headers.insert(name, value);
        }

        let body = Bytes::from(spec.mock_body.clone());
        let body_length = HeaderValue::from(body.len());
        Ok(Self {
            status,
            headers,
            body,
            body_length,
        })
    }

    /// Overwrite `resp` with the mock.
    pub fn fallback(&self, resp: &mut Response) {
        resp.set_status(self.status);
        let headers = resp.headers_mut();
        headers.insert(header::CONTENT_LENGTH, self.body_length.clone());
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        resp.set_body(self.body.clone());
    }
}

/// Filter applying a [`Fallback`] to every request.
pub struct FallbackFilter {
    spec: FilterSpec,
    fallback: Fallback,
}

fn validate(spec: &FilterSpec) -> Result<(), FilterError> {
    let typed: FallbackSpec = spec.decode(&KIND)?;
    Fallback::new(&typed).map_err(|e| FilterError::invalid(&spec.name, e))?;
    Ok(())
}

fn create_instance(spec: FilterSpec, _ctx: &FilterContext) -> Result<Arc<dyn Filter>, FilterError> {
    let typed: FallbackSpec = spec.decode(&KIND)?;
    let fallback = Fallback::new(&typed).map_err(|e| FilterError::invalid(&spec.name, e))?;
    Ok(Arc::new(FallbackFilter { spec, fallback }))
}

#[async_trait]
impl Filter for FallbackFilter {
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
        self.fallback.fallback(ctx.response_mut());
        FilterResult::Continue
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Request;

    fn spec() -> FallbackSpec {
        FallbackSpec {
            mock_code: 503,
            mock_headers: BTreeMap::from([
                ("Content-Type".to_string(), "application/json".to_string()),
                ("X-Fallback".to_string(), "yes".to_string()),
            ]),
            mock_body: r#"{"error":"unavailable"}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn test_fallback_overwrites_response() {
        let fallback = Fallback::new(&spec()).unwrap();
        let mut resp = Response::new();
        resp.headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        resp.set_body("original");

        fallback.fallback(&mut resp);

        let http = resp.into_http();
        assert_eq!(http.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http.headers()[header::CONTENT_LENGTH], "23");
        assert_eq!(http.headers()["x-fallback"], "yes");
        assert_eq!(http.headers()[header::CONTENT_TYPE], "application/json");
        let body = axum::body::to_bytes(http.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], br#"{"error":"unavailable"}"#);
    }

    #[test]
    fn test_invalid_code_rejected() {
        let mut bad = spec();
        bad.mock_code = 42;
        assert!(Fallback::new(&bad).is_err());
    }

    #[tokio::test]
    async fn test_filter_is_shareable_across_requests() {
        let spec = FilterSpec::from_value(json!({
            "name": "mock",
            "kind": "Fallback",
            "mockCode": 200,
            "mockBody": "ok",
        }))
        .unwrap();
        let filter = KIND.init(spec, &FilterContext::detached("p")).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let filter = filter.clone();
            tasks.push(tokio::spawn(async move {
                let mut ctx = HttpContext::new(Request::default());
                let result = filter.handle(&mut ctx).await;
                (result, ctx.response().status())
            }));
        }
        for task in tasks {
            let (result, status) = task.await.unwrap();
            assert_eq!(result, FilterResult::Continue);
            assert_eq!(status, StatusCode::OK);
        }
    }
}
