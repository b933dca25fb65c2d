//! Per-request context shared by every filter in a pipeline.
//!
//! # Data Flow
//! ```text
//! axum Request<Body>
//!     → HttpContext::from_request (request model, deadline)
//!     → pipeline filters read/modify request.rs and response.rs
//!     → HttpContext::into_response → axum Response<Body>
//!
//! Aggregator sub-calls:
//!     derived Request → HttpContext::new (fresh response recorder)
//!     → sub-pipeline → recorded Response collected by the aggregator
//! ```
//!
//! # Design Decisions
//! - One context per request; never shared across tasks
//! - Response starts as `200 OK` with an empty body, like a test recorder
//! - Tags are free-text diagnostics, logged when the request finishes

pub mod body;
pub mod request;
pub mod response;

use tokio::time::Instant;

pub use body::{read_limited, BodyReadError};
pub use request::{DistinguishedName, PeerCertificate, Request, TlsState};
pub use response::Response;

/// Request/response pair travelling through a pipeline.
#[derive(Debug)]
pub struct HttpContext {
    request: Request,
    response: Response,
    tags: Vec<String>,
    deadline: Option<Instant>,
}

impl HttpContext {
    /// Wrap a request with an empty response recorder.
    pub fn new(request: Request) -> Self {
        Self {
            request,
            response: Response::new(),
            tags: Vec::new(),
            deadline: None,
        }
    }

    /// Build a context from an inbound axum request.
    pub fn from_request(req: axum::http::Request<axum::body::Body>) -> Self {
        Self::new(Request::from_http(req))
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    /// Attach a diagnostic tag to this request.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.tags.push(tag.into());
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Point in time after which work on behalf of this request is abandoned.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Consume the context, keeping only the recorded response.
    pub fn into_response(self) -> Response {
        self.response
    }
}

/// Returns the earlier of two optional deadlines.
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
