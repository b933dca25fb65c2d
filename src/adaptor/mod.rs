//! Request rewrite utilities.
//!
//! # Data Flow
//! ```text
//! PathAdaptSpec / HeaderAdaptSpec (config)
//!     → compiled once at filter init (regex, header names/values)
//!     → applied per request to a derived request
//! ```
//!
//! # Design Decisions
//! - Compiled adaptors are immutable and shared across requests
//! - Invalid rules are rejected when the owning filter spec is validated

pub mod header;
pub mod path;

pub use header::{HeaderAdaptSpec, HeaderAdaptor};
pub use path::{PathAdaptSpec, PathAdaptor, RegexpReplace};

use thiserror::Error;

/// Invalid adaptor rule.
#[derive(Debug, Error)]
pub enum AdaptorError {
    #[error("invalid regexp {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid header name {0:?}")]
    HeaderName(String),

    #[error("invalid value for header {0:?}")]
    HeaderValue(String),
}
