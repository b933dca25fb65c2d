//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the gateway handler
//! - Wire up middleware (tracing, limits, request ID, timeout)
//! - Serve plain TCP or TLS until shutdown; TLS requests carry the peer
//!   certificate chain as an `Arc<TlsState>` extension
//! - Dispatch requests: route → pipeline → response
//! - Apply configuration updates (routes and pipelines) while serving

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::GatewayConfig;
use crate::context::HttpContext;
use crate::filters::registry;
use crate::net::acceptor::PeerCertAcceptor;
use crate::net::tls::{load_tls_config, TlsError};
use crate::observability::metrics;
use crate::pipeline::{HttpHandler, PipelineError, TrafficController};
use crate::routing::RouteTable;

/// Errors starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to load TLS material: {0}")]
    Tls(#[from] TlsError),

    #[error("failed to build pipelines: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    Pipelines(Vec<PipelineError>),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub routes: Arc<ArcSwap<RouteTable>>,
    pub controller: Arc<TrafficController>,
    pub request_timeout: Duration,
}

/// HTTP server of the gateway.
pub struct HttpServer {
    config: GatewayConfig,
    state: AppState,
}

impl HttpServer {
    /// Create a server with the built-in filter kinds.
    pub async fn new(config: GatewayConfig) -> Result<Self, ServerError> {
        Self::with_controller(config, TrafficController::new(registry())).await
    }

    /// Create a server around an existing controller and build its pipelines.
    pub async fn with_controller(
        config: GatewayConfig,
        controller: Arc<TrafficController>,
    ) -> Result<Self, ServerError> {
        controller
            .apply(&config.pipelines)
            .await
            .map_err(ServerError::Pipelines)?;

        let state = AppState {
            routes: Arc::new(ArcSwap::from_pointee(RouteTable::from_config(&config.routes))),
            controller,
            request_timeout: Duration::from_secs(config.timeouts.request_secs),
        };
        Ok(Self { config, state })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(&self) -> Router {
        // The pipeline deadline fires before the layer timeout, so filters
        // render their own failure response first.
        let layer_timeout = self.state.request_timeout + Duration::from_secs(1);

        Router::new()
            .route("/", any(gateway_handler))
            .route("/{*path}", any(gateway_handler))
            .with_state(self.state.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
                        let request_id = req
                            .headers()
                            .get("x-request-id")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("-");
                        tracing::info_span!(
                            "request",
                            method = %req.method(),
                            uri = %req.uri(),
                            request_id = %request_id,
                        )
                    }))
                    .layer(PropagateRequestIdLayer::x_request_id())
                    .layer(RequestBodyLimitLayer::new(self.config.listener.max_body_bytes))
                    .layer(TimeoutLayer::new(layer_timeout)),
            )
    }

    /// Controller owning the pipelines.
    pub fn controller(&self) -> &Arc<TrafficController> {
        &self.state.controller
    }

    /// Get a reference to the config the server was started with.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Run the server until `shutdown` fires, applying `config_updates` as
    /// they arrive. Pipelines are closed on exit.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<GatewayConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        let app = self.build_router();
        let grace = Duration::from_secs(self.config.timeouts.shutdown_grace_secs);
        let rustls = match &self.config.listener.tls {
            Some(tls) => Some(load_tls_config(tls).await?),
            None => None,
        };

        let updates = {
            let state = self.state.clone();
            tokio::spawn(async move {
                while let Some(config) = config_updates.recv().await {
                    apply_update(&state, config).await;
                }
            })
        };

        let served = match rustls {
            Some(rustls) => {
                tracing::info!(address = %addr, tls = true, "HTTP server starting");

                let handle = axum_server::Handle::new();
                let stopper = handle.clone();
                tokio::spawn(async move {
                    let _ = shutdown.recv().await;
                    tracing::info!("Shutdown signal received");
                    stopper.graceful_shutdown(Some(grace));
                });

                axum_server::from_tcp(listener.into_std()?)
                    .acceptor(PeerCertAcceptor::new(rustls))
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await
            }
            None => {
                tracing::info!(address = %addr, tls = false, "HTTP server starting");
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.recv().await;
                        tracing::info!("Shutdown signal received");
                    })
                    .await
            }
        };

        updates.abort();
        self.state.controller.close().await;
        served?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Swap in a reloaded configuration: pipelines first, then routes.
pub async fn apply_update(state: &AppState, config: GatewayConfig) {
    if let Err(errors) = state.controller.apply(&config.pipelines).await {
        for e in &errors {
            tracing::error!(error = %e, "Pipeline reload failed");
        }
    }
    state
        .routes
        .store(Arc::new(RouteTable::from_config(&config.routes)));
    tracing::info!(
        routes = config.routes.len(),
        pipelines = config.pipelines.len(),
        "Configuration reloaded"
    );
}

/// Route the request to its pipeline and render the pipeline's response.
async fn gateway_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();

    let (route, pipeline_name) = {
        let routes = state.routes.load();
        match routes.match_request(&request) {
            Some(route) => (route.name.clone(), route.pipeline.clone()),
            None => {
                tracing::warn!(path = %request.uri().path(), "No route matched");
                metrics::record_request("none", &method, 404, start);
                return (StatusCode::NOT_FOUND, "No matching route found").into_response();
            }
        }
    };

    let Some(pipeline) = state.controller.get(&pipeline_name) else {
        tracing::error!(route = %route, pipeline = %pipeline_name, "Pipeline not found");
        metrics::record_request(&route, &method, 503, start);
        return (StatusCode::SERVICE_UNAVAILABLE, "Pipeline not available").into_response();
    };

    let mut ctx = HttpContext::from_request(request);
    ctx.set_deadline(Some(tokio::time::Instant::now() + state.request_timeout));
    pipeline.handle(&mut ctx).await;

    if !ctx.tags().is_empty() {
        tracing::debug!(route = %route, pipeline = %pipeline_name, tags = ?ctx.tags(), "Request tags");
    }

    let response = ctx.into_response().into_http();
    metrics::record_request(&route, &method, response.status().as_u16(), start);
    response
}
