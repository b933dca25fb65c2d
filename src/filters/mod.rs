//! Filter subsystem.
//!
//! # Data Flow
//! ```text
//! FilterSpec (name, kind, props)
//!     → registry.rs (kind name → &'static Kind)
//!     → Kind::validate (typed spec decode, semantic checks)
//!     → Kind::create_instance (Init) | Kind::inherit (successor of a live instance)
//!     → Arc<dyn Filter> owned by one pipeline generation
//!     → Filter::handle per request → FilterResult
//! ```
//!
//! # Design Decisions
//! - Kinds are immutable statics; the registry is built once and never mutated
//! - Typed specs are decoded from the kind's defaults overlaid with user props
//! - User input errors are returned; only broken deployments panic
//! - A new generation never mutates the old one; pipelines swap whole instances
//!   and close the old ones after the swap

pub mod aggregator;
pub mod cert_extractor;
pub mod fallback;
pub mod proxy;
pub mod registry;

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::context::HttpContext;
use crate::pipeline::{HttpHandler, PipelineSource};

pub use registry::{registry, Registry};

/// Errors raised while validating or building filters.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("unknown filter kind {0:?}")]
    UnknownKind(String),

    #[error("filter kind {0:?} registered twice")]
    DuplicateKind(&'static str),

    #[error("filter {name:?}: {reason}")]
    InvalidSpec { name: String, reason: String },
}

impl FilterError {
    pub fn invalid(name: impl Into<String>, reason: impl fmt::Display) -> Self {
        FilterError::InvalidSpec {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Outcome of one `Filter::handle` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    /// Success; the pipeline moves on to the next filter.
    Continue,
    /// One of the kind's declared result names.
    Named(&'static str),
}

impl FilterResult {
    pub fn is_continue(&self) -> bool {
        matches!(self, FilterResult::Continue)
    }

    /// The result name, empty for `Continue`.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterResult::Continue => "",
            FilterResult::Named(name) => name,
        }
    }
}

/// Configuration of one filter instance: common fields plus kind-specific props.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FilterSpec {
    pub name: String,
    pub kind: String,
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

impl FilterSpec {
    /// Build a spec from a JSON object holding `name`, `kind` and props.
    pub fn from_value(value: Value) -> Result<Self, FilterError> {
        let name = value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        serde_json::from_value(value).map_err(|e| FilterError::invalid(name, e))
    }

    /// Decode the kind-specific spec: kind defaults overlaid with user props.
    pub fn decode<T: DeserializeOwned>(&self, kind: &Kind) -> Result<T, FilterError> {
        let mut merged = match (kind.default_spec)() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in &self.props {
            merged.insert(key.clone(), value.clone());
        }
        serde_json::from_value(Value::Object(merged)).map_err(|e| FilterError::invalid(&self.name, e))
    }
}

/// Collaborators handed to filters at Init.
#[derive(Clone)]
pub struct FilterContext {
    pipeline: String,
    source: Weak<dyn PipelineSource>,
}

/// Placeholder source for filters built outside a traffic controller.
struct NoPipelines;

impl PipelineSource for NoPipelines {
    fn get_pipeline(&self, _name: &str) -> Option<Arc<dyn HttpHandler>> {
        None
    }
}

impl FilterContext {
    /// `pipeline` is the name of the pipeline owning the filter.
    pub fn new(pipeline: impl Into<String>, source: Weak<dyn PipelineSource>) -> Self {
        Self {
            pipeline: pipeline.into(),
            source,
        }
    }

    /// Context with no pipeline source attached.
    pub fn detached(pipeline: impl Into<String>) -> Self {
        let source: Weak<dyn PipelineSource> = Weak::<NoPipelines>::new();
        Self::new(pipeline, source)
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Weak handle to the pipeline source.
    pub fn source(&self) -> Weak<dyn PipelineSource> {
        self.source.clone()
    }

    /// Whether the pipeline source is still alive.
    pub fn has_source(&self) -> bool {
        self.source.strong_count() > 0
    }
}

/// Immutable descriptor of one filter type.
pub struct Kind {
    pub name: &'static str,
    pub description: &'static str,
    /// Result names `handle` may return besides `Continue`.
    pub results: &'static [&'static str],
    /// Defaults for the kind-specific props, as a JSON object.
    pub default_spec: fn() -> Value,
    /// Schema and semantic checks without building an instance.
    pub validate: fn(&FilterSpec) -> Result<(), FilterError>,
    /// Init: build a fresh instance from a spec.
    pub create_instance: fn(FilterSpec, &FilterContext) -> Result<Arc<dyn Filter>, FilterError>,
}

impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kind")
            .field("name", &self.name)
            .field("results", &self.results)
            .finish()
    }
}

impl Kind {
    /// Init a first generation.
    pub fn init(&self, spec: FilterSpec, ctx: &FilterContext) -> Result<Arc<dyn Filter>, FilterError> {
        (self.create_instance)(spec, ctx)
    }

    /// Build the successor of `previous` from `spec`.
    ///
    /// `previous` keeps serving in-flight requests; the owner of its
    /// generation closes it once the successor is installed.
    pub fn inherit(
        &self,
        spec: FilterSpec,
        previous: &dyn Filter,
        ctx: &FilterContext,
    ) -> Result<Arc<dyn Filter>, FilterError> {
        tracing::debug!(
            pipeline = ctx.pipeline(),
            filter = previous.name(),
            kind = self.name,
            "Inheriting filter"
        );
        self.init(spec, ctx)
    }

    pub fn declares(&self, result: &str) -> bool {
        self.results.contains(&result)
    }
}

/// A configured, running filter.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Instance name, unique within its pipeline.
    fn name(&self) -> &str;

    fn kind(&self) -> &'static Kind;

    fn spec(&self) -> &FilterSpec;

    /// Per-request hook.
    async fn handle(&self, ctx: &mut HttpContext) -> FilterResult;

    /// Diagnostic snapshot.
    fn status(&self) -> Value {
        Value::Null
    }

    /// Release resources. Must be idempotent.
    fn close(&self);
}
