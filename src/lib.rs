//! Pipeline gateway library: HTTP filters, pipelines and the server around them.

pub mod adaptor;
pub mod config;
pub mod context;
pub mod filters;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pipeline;
pub mod routing;

pub use config::GatewayConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use pipeline::TrafficController;
