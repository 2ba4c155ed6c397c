//! Error types for NTunnel.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Envelope bytes are not JSON or miss/mistype a required field.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Sealed payload failed authentication or is not a sealed message at all.
    #[error("Unwrap error: {0}")]
    Unwrap(String),

    #[error("Seal error: {0}")]
    Seal(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// No endpoint acknowledged a publish.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request {id} timed out after {}ms", elapsed.as_millis())]
    Timeout { id: String, elapsed: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedEnvelope(e.to_string())
    }
}
