//! Error types for the Tollgate node.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum NodeError {
    /// The remote peer exceeded its allowance for a topic.
    ///
    /// The display text is also the message written back to the peer.
    #[error("rate limited")]
    RateLimited,

    /// A topic reached the limiter without a registered budget.
    #[error("no rate limit budget registered for topic {0}")]
    UnconfiguredTopic(String),

    /// The peer sent a request that could not be served.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No handler exists for the stream's protocol.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed protobuf payloads
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, NodeError>;
