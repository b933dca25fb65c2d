//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → tls.rs (rustls server config, optional client CA)
//!     → acceptor.rs (handshake, peer chain → Arc<TlsState> extension)
//!     → Hand off to HTTP layer
//! ```

pub mod acceptor;
pub mod tls;
