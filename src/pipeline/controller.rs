//! Traffic controller: owner of the named pipelines.
//!
//! # Responsibilities
//! - Build pipeline generations from configuration
//! - Swap the whole name → pipeline map atomically on reload
//! - Serve pipeline lookups for the HTTP server and the aggregator
//!
//! # Design Decisions
//! - `ArcSwap` so lookups never block reloads and never see a partial map
//! - In-flight requests keep the `Arc<Pipeline>` they resolved
//! - A pipeline that fails to build keeps its previous generation, untouched
//! - Replaced generations are closed after the swap, exactly once
//! - Filters hold a `Weak` back-reference, so controller and pipelines
//!   do not keep each other alive

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use tokio::sync::Mutex;

use super::{HttpHandler, Pipeline, PipelineError, PipelineSource, PipelineSpec};
use crate::filters::{FilterContext, Registry};

type PipelineMap = HashMap<String, Arc<Pipeline>>;

/// Stores and supervises named pipeline instances.
pub struct TrafficController {
    registry: &'static Registry,
    pipelines: ArcSwap<PipelineMap>,
    /// Serializes `apply` calls; lookups never take it.
    reload: Mutex<()>,
    me: Weak<TrafficController>,
}

impl std::fmt::Debug for TrafficController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrafficController")
            .field("pipelines", &self.pipeline_names())
            .finish()
    }
}

impl TrafficController {
    /// Create an empty controller using `registry` to resolve kinds.
    pub fn new(registry: &'static Registry) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            registry,
            pipelines: ArcSwap::from_pointee(HashMap::new()),
            reload: Mutex::new(()),
            me: me.clone(),
        })
    }

    /// Install a new configuration generation.
    ///
    /// Pipelines missing from `specs` are closed and removed. Errors are
    /// collected per pipeline; the failing ones keep serving their previous
    /// generation (or stay absent).
    pub async fn apply(&self, specs: &[PipelineSpec]) -> Result<(), Vec<PipelineError>> {
        let _guard = self.reload.lock().await;

        let current = self.pipelines.load_full();
        let mut next = PipelineMap::with_capacity(specs.len());
        let mut errors = Vec::new();

        for spec in specs {
            let previous = current.get(&spec.name);
            let source: Weak<dyn PipelineSource> = self.me.clone();
            let ctx = FilterContext::new(spec.name.clone(), source);

            match Pipeline::build(spec.clone(), previous.map(Arc::as_ref), self.registry, &ctx) {
                Ok(pipeline) => {
                    tracing::info!(
                        pipeline = %spec.name,
                        filters = pipeline.filters().len(),
                        reloaded = previous.is_some(),
                        "Pipeline generation built"
                    );
                    next.insert(spec.name.clone(), Arc::new(pipeline));
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to build pipeline, keeping current generation");
                    if let Some(previous) = previous {
                        next.insert(spec.name.clone(), previous.clone());
                    }
                    errors.push(e);
                }
            }
        }

        self.pipelines.store(Arc::new(next.clone()));

        // Retire replaced and removed generations only after the swap.
        for (name, old) in current.iter() {
            match next.get(name) {
                Some(kept) if Arc::ptr_eq(kept, old) => {}
                Some(_) => old.close(),
                None => {
                    tracing::info!(pipeline = %name, "Pipeline removed");
                    old.close();
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Look up the current generation of a pipeline.
    pub fn get(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.load().get(name).cloned()
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pipelines.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Status of every pipeline keyed by name.
    pub fn status(&self) -> serde_json::Value {
        let map: serde_json::Map<_, _> = self
            .pipelines
            .load()
            .iter()
            .map(|(name, p)| (name.clone(), p.status()))
            .collect();
        serde_json::Value::Object(map)
    }

    /// Close and drop every pipeline.
    pub async fn close(&self) {
        let _guard = self.reload.lock().await;
        let old = self.pipelines.swap(Arc::new(HashMap::new()));
        for pipeline in old.values() {
            pipeline.close();
        }
        tracing::info!(count = old.len(), "Traffic controller closed");
    }
}

impl PipelineSource for TrafficController {
    fn get_pipeline(&self, name: &str) -> Option<Arc<dyn HttpHandler>> {
        self.get(name).map(|p| p as Arc<dyn HttpHandler>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::{registry, FilterSpec};
    use serde_json::json;

    fn spec(name: &str, code: u16) -> PipelineSpec {
        PipelineSpec {
            name: name.into(),
            flow: vec![],
            filters: vec![FilterSpec::from_value(json!({
                "name": "mock",
                "kind": "Fallback",
                "mockCode": code,
            }))
            .unwrap()],
        }
    }

    #[tokio::test]
    async fn test_apply_and_lookup() {
        let controller = TrafficController::new(registry());
        controller.apply(&[spec("a", 200), spec("b", 201)]).await.unwrap();
        assert_eq!(controller.pipeline_names(), ["a", "b"]);
        assert!(controller.get_pipeline("a").is_some());
        assert!(controller.get_pipeline("c").is_none());
    }

    #[tokio::test]
    async fn test_reload_swaps_generation_and_removes() {
        let controller = TrafficController::new(registry());
        controller.apply(&[spec("a", 200), spec("b", 201)]).await.unwrap();
        let first = controller.get("a").unwrap();

        controller.apply(&[spec("a", 202)]).await.unwrap();
        let second = controller.get("a").unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(controller.pipeline_names(), ["a"]);
    }

    #[tokio::test]
    async fn test_failed_build_keeps_previous_generation() {
        let controller = TrafficController::new(registry());
        controller.apply(&[spec("a", 200)]).await.unwrap();
        let first = controller.get("a").unwrap();

        let broken = PipelineSpec {
            name: "a".into(),
            flow: vec![],
            filters: vec![FilterSpec::from_value(json!({"name": "x", "kind": "Unknown"})).unwrap()],
        };
        let errors = controller.apply(&[broken]).await.unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(Arc::ptr_eq(&first, &controller.get("a").unwrap()));
    }

    fn front(mock_code: u16) -> PipelineSpec {
        PipelineSpec {
            name: "front".into(),
            flow: vec![],
            filters: vec![
                FilterSpec::from_value(json!({
                    "name": "agg",
                    "kind": "APIAggregator",
                    "pipelines": [{"name": "a"}],
                }))
                .unwrap(),
                FilterSpec::from_value(json!({
                    "name": "mock",
                    "kind": "Fallback",
                    "mockCode": mock_code,
                }))
                .unwrap(),
            ],
        }
    }

    #[tokio::test]
    async fn test_rejected_reload_leaves_live_generation_open() {
        let controller = TrafficController::new(registry());
        controller.apply(&[front(200)]).await.unwrap();
        let live = controller.get("front").unwrap();

        // `agg` would be inherited, but `mock` is invalid.
        assert!(controller.apply(&[front(42)]).await.is_err());

        let current = controller.get("front").unwrap();
        assert!(Arc::ptr_eq(&live, &current));
        assert_eq!(current.filter("agg").unwrap().status()["closed"], json!(false));
    }

    #[tokio::test]
    async fn test_replaced_generation_closed_after_swap() {
        let controller = TrafficController::new(registry());
        controller.apply(&[front(200)]).await.unwrap();
        let old = controller.get("front").unwrap();

        controller.apply(&[front(201)]).await.unwrap();
        let new = controller.get("front").unwrap();

        assert_eq!(old.filter("agg").unwrap().status()["closed"], json!(true));
        assert_eq!(new.filter("agg").unwrap().status()["closed"], json!(false));

        controller.close().await;
        assert_eq!(new.filter("agg").unwrap().status()["closed"], json!(true));
    }
}
