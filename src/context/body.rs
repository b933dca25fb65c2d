//! Bounded body reading.

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, LengthLimitError};
use thiserror::Error;

/// Failure while buffering a body.
#[derive(Debug, Error)]
pub enum BodyReadError {
    /// The stream yielded more than `limit` bytes.
    #[error("body exceeds {limit}B")]
    TooLarge { limit: u64 },

    /// The stream ended with something other than a clean end-of-stream.
    #[error("read body failed: {0}")]
    Stream(#[from] axum::Error),
}

/// Buffer a body, failing as soon as it grows past `limit` bytes.
///
/// A body of exactly `limit` bytes is accepted. Trailers are ignored. A body
/// already cut off by an outer length limit also reports `TooLarge`.
pub async fn read_limited(mut body: Body, limit: u64) -> Result<Bytes, BodyReadError> {
    let mut buf = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) if exceeds_length_limit(&e) => return Err(BodyReadError::TooLarge { limit }),
            Err(e) => return Err(e.into()),
        };
        if let Ok(data) = frame.into_data() {
            if (buf.len() + data.len()) as u64 > limit {
                return Err(BodyReadError::TooLarge { limit });
            }
            buf.extend_from_slice(&data);
        }
    }
    Ok(buf.freeze())
}

fn exceeds_length_limit(err: &axum::Error) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if e.is::<LengthLimitError>() {
            return true;
        }
        current = e.source();
    }
    false
}
