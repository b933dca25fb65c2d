//! Response model written by filters.
//!
//! # Responsibilities
//! - Settable status code, header map and replaceable payload
//! - Render into an axum response once the pipeline finishes
//!
//! # Design Decisions
//! - Starts as `200 OK` with no body; filters overwrite what they own
//! - Payload is a streaming `Body` so proxied responses are not buffered

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};

/// An HTTP response under construction.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Body::empty(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn set_headers(&mut self, headers: HeaderMap) {
        self.headers = headers;
    }

    /// Replace the payload.
    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    /// Take the payload, leaving an empty body behind.
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    /// Render into an axum response.
    pub fn into_http(self) -> axum::http::Response<Body> {
        let mut resp = axum::http::Response::new(self.body);
        *resp.status_mut() = self.status;
        *resp.headers_mut() = self.headers;
        resp
    }
}
