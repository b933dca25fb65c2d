//! Pipelines: named, ordered filter chains.
//!
//! # Data Flow
//! ```text
//! PipelineSpec (filters + optional flow)
//!     → Pipeline::build (Init or Inherit per filter, resolve jumps)
//!     → controller.rs stores Arc<Pipeline> under its name
//!
//! Per request:
//!     HttpContext → flow[0].handle → result
//!         Continue      → next node
//!         jumpIf match  → target node, or END
//!         unmapped      → stop
//! ```
//!
//! # Design Decisions
//! - A built pipeline is immutable; reload builds a new generation
//! - Jumps only go forward, so every flow terminates
//! - A generation is fully built before its predecessor is touched; the
//!   predecessor is closed only after the swap

pub mod controller;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::HttpContext;
use crate::filters::{Filter, FilterContext, FilterError, FilterSpec, Registry};

pub use controller::TrafficController;

/// Jump target that ends the pipeline.
pub const END: &str = "END";

/// Something that runs a full filter chain against a context.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn handle(&self, ctx: &mut HttpContext);
}

/// Resolves pipeline names to live handlers.
///
/// Consulted per request; results must not be cached beyond it.
pub trait PipelineSource: Send + Sync {
    fn get_pipeline(&self, name: &str) -> Option<Arc<dyn HttpHandler>>;
}

/// Errors building a pipeline generation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline {pipeline:?}: {source}")]
    Filter {
        pipeline: String,
        #[source]
        source: FilterError,
    },

    #[error("pipeline {pipeline:?}: duplicate filter name {filter:?}")]
    DuplicateFilter { pipeline: String, filter: String },

    #[error("pipeline {pipeline:?}: invalid flow: {reason}")]
    InvalidFlow { pipeline: String, reason: String },
}

/// One step of a pipeline flow.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub filter: String,
    /// Filter result → name of a later filter in the flow, or `END`.
    #[serde(default)]
    pub jump_if: BTreeMap<String, String>,
}

/// Pipeline configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PipelineSpec {
    pub name: String,

    /// Explicit flow; defaults to every filter in declaration order.
    #[serde(default)]
    pub flow: Vec<FlowNode>,

    #[serde(default)]
    pub filters: Vec<FilterSpec>,
}

impl PipelineSpec {
    pub fn effective_flow(&self) -> Vec<FlowNode> {
        if !self.flow.is_empty() {
            return self.flow.clone();
        }
        self.filters
            .iter()
            .map(|f| FlowNode {
                filter: f.name.clone(),
                jump_if: BTreeMap::new(),
            })
            .collect()
    }

    /// Structural checks: unique names, known kinds, declared results, forward jumps.
    pub fn validate(&self, registry: &Registry) -> Result<(), PipelineError> {
        let mut kinds = HashMap::new();
        for spec in &self.filters {
            let kind = registry.lookup(&spec.kind).map_err(|source| PipelineError::Filter {
                pipeline: self.name.clone(),
                source,
            })?;
            if kinds.insert(spec.name.as_str(), kind).is_some() {
                return Err(PipelineError::DuplicateFilter {
                    pipeline: self.name.clone(),
                    filter: spec.name.clone(),
                });
            }
        }

        let invalid = |reason: String| PipelineError::InvalidFlow {
            pipeline: self.name.clone(),
            reason,
        };

        let flow = self.effective_flow();
        for (i, node) in flow.iter().enumerate() {
            let kind = kinds
                .get(node.filter.as_str())
                .ok_or_else(|| invalid(format!("filter {:?} not defined", node.filter)))?;
            for (result, target) in &node.jump_if {
                if !kind.declares(result) {
                    return Err(invalid(format!(
                        "{} does not declare result {:?}",
                        kind.name, result
                    )));
                }
                if target != END && !flow[i + 1..].iter().any(|n| &n.filter == target) {
                    return Err(invalid(format!(
                        "jump target {:?} must be a later filter or END",
                        target
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Jump {
    To(usize),
    End,
}

struct Step {
    filter: Arc<dyn Filter>,
    jumps: HashMap<&'static str, Jump>,
}

/// One generation of a named pipeline.
pub struct Pipeline {
    name: String,
    spec: PipelineSpec,
    filters: Vec<Arc<dyn Filter>>,
    steps: Vec<Step>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("filters", &self.filters.iter().map(|f| f.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Pipeline {
    /// Build a generation, inheriting same-name same-kind filters from `previous`.
    ///
    /// Every filter spec is validated before any instance is created, and
    /// `previous` is left untouched: the caller closes it once the new
    /// generation is installed. On failure the instances built so far are
    /// closed.
    pub fn build(
        spec: PipelineSpec,
        previous: Option<&Pipeline>,
        registry: &Registry,
        ctx: &FilterContext,
    ) -> Result<Self, PipelineError> {
        spec.validate(registry)?;

        let filter_error = |source| PipelineError::Filter {
            pipeline: spec.name.clone(),
            source,
        };

        let mut kinds = Vec::with_capacity(spec.filters.len());
        for filter_spec in &spec.filters {
            let kind = registry.lookup(&filter_spec.kind).map_err(filter_error)?;
            (kind.validate)(filter_spec).map_err(filter_error)?;
            kinds.push(kind);
        }

        let mut filters: Vec<Arc<dyn Filter>> = Vec::with_capacity(spec.filters.len());
        for (filter_spec, kind) in spec.filters.iter().zip(kinds) {
            let prev = previous
                .and_then(|p| p.filter(&filter_spec.name))
                .filter(|f| f.kind().name == kind.name);

            let built = match prev {
                Some(prev) => kind.inherit(filter_spec.clone(), prev.as_ref(), ctx),
                None => kind.init(filter_spec.clone(), ctx),
            };
            match built {
                Ok(filter) => filters.push(filter),
                Err(source) => {
                    for filter in &filters {
                        filter.close();
                    }
                    return Err(filter_error(source));
                }
            }
        }

        let flow = spec.effective_flow();
        let mut steps = Vec::with_capacity(flow.len());
        for node in &flow {
            let filter = filters
                .iter()
                .find(|f| f.name() == node.filter)
                .cloned()
                .ok_or_else(|| PipelineError::InvalidFlow {
                    pipeline: spec.name.clone(),
                    reason: format!("filter {:?} not defined", node.filter),
                })?;
            let mut jumps = HashMap::new();
            for (result, target) in &node.jump_if {
                // validate() guarantees the kind declares `result`.
                let Some(declared) = filter.kind().results.iter().find(|r| **r == result.as_str())
                else {
                    continue;
                };
                let jump = if target == END {
                    Jump::End
                } else {
                    flow.iter()
                        .position(|n| &n.filter == target)
                        .map(Jump::To)
                        .unwrap_or(Jump::End)
                };
                jumps.insert(*declared, jump);
            }
            steps.push(Step { filter, jumps });
        }

        Ok(Self {
            name: spec.name.clone(),
            spec,
            filters,
            steps,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub fn filter(&self, name: &str) -> Option<&Arc<dyn Filter>> {
        self.filters.iter().find(|f| f.name() == name)
    }

    pub fn filters(&self) -> &[Arc<dyn Filter>] {
        &self.filters
    }

    /// Status of every filter keyed by filter name.
    pub fn status(&self) -> serde_json::Value {
        let map: serde_json::Map<_, _> = self
            .filters
            .iter()
            .map(|f| (f.name().to_string(), f.status()))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Close every filter of this generation.
    pub fn close(&self) {
        for filter in &self.filters {
            filter.close();
        }
    }
}

#[async_trait]
impl HttpHandler for Pipeline {
    async fn handle(&self, ctx: &mut HttpContext) {
        let mut i = 0;
        while let Some(step) = self.steps.get(i) {
            let result = step.filter.handle(ctx).await;
            if result.is_continue() {
                i += 1;
                continue;
            }

            tracing::debug!(
                pipeline = %self.name,
                filter = step.filter.name(),
                result = result.as_str(),
                "Filter returned result"
            );
            match step.jumps.get(result.as_str()) {
                Some(Jump::To(next)) => i = *next,
                Some(Jump::End) | None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::registry;
    use serde_json::json;

    fn fallback(name: &str, code: u16, body: &str) -> FilterSpec {
        FilterSpec::from_value(json!({
            "name": name,
            "kind": "Fallback",
            "mockCode": code,
            "mockBody": body,
        }))
        .unwrap()
    }

    #[test]
    fn test_flow_validation() {
        let spec = PipelineSpec {
            name: "p".into(),
            flow: vec![FlowNode {
                filter: "missing".into(),
                jump_if: BTreeMap::new(),
            }],
            filters: vec![fallback("f", 200, "")],
        };
        assert!(matches!(
            spec.validate(registry()),
            Err(PipelineError::InvalidFlow { .. })
        ));
    }

    #[test]
    fn test_undeclared_result_rejected() {
        let spec = PipelineSpec {
            name: "p".into(),
            flow: vec![FlowNode {
                filter: "f".into(),
                jump_if: BTreeMap::from([("failed".to_string(), END.to_string())]),
            }],
            filters: vec![fallback("f", 200, "")],
        };
        assert!(matches!(
            spec.validate(registry()),
            Err(PipelineError::InvalidFlow { .. })
        ));
    }

    #[test]
    fn test_duplicate_filter_rejected() {
        let spec = PipelineSpec {
            name: "p".into(),
            flow: vec![],
            filters: vec![fallback("f", 200, ""), fallback("f", 201, "")],
        };
        assert!(matches!(
            spec.validate(registry()),
            Err(PipelineError::DuplicateFilter { .. })
        ));
    }

    #[tokio::test]
    async fn test_filters_run_in_order() {
        let spec = PipelineSpec {
            name: "p".into(),
            flow: vec![],
            filters: vec![fallback("first", 201, "one"), fallback("second", 202, "two")],
        };
        let pipeline =
            Pipeline::build(spec, None, registry(), &FilterContext::detached("p")).unwrap();

        let mut ctx = HttpContext::new(crate::context::Request::default());
        pipeline.handle(&mut ctx).await;

        let resp = ctx.into_response().into_http();
        assert_eq!(resp.status(), 202);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"two");
    }
}
