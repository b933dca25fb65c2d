//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, middleware: request ID, trace, body limit, timeout)
//!     → routing (host / path prefix → pipeline name)
//!     → TrafficController (pipeline lookup)
//!     → Pipeline (filters fill in the response)
//!     → Send to client
//! ```

pub mod server;

pub use server::{AppState, HttpServer, ServerError};
