//! Error types for frame parsing and payload decoding.

use thiserror::Error;

/// Errors produced while parsing frames or decoding their payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame matched a known shape but its structure was broken
    /// (missing separator, truncated payload, non-array event body).
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A payload that should have been valid JSON was not.
    #[error("failed to decode payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// A handshake response did not contain the expected token.
    #[error("handshake response missing {0}")]
    Handshake(&'static str),
}
