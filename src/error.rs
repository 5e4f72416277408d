//! Error types for sessionwire.

use thiserror::Error;

/// Main error type for all sessionwire operations.
#[derive(Debug, Error)]
pub enum WireError {
    /// I/O error on the underlying connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Structurally invalid input detected at the frame or packet layer.
    ///
    /// Always fatal to the connection; surfaced to the dispatch callback
    /// as a `gibberish` notification, never as a raw error.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Peer closed, I/O failure or timeout on the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The engine is closing or closed and no longer accepts sends.
    #[error("protocol engine closed")]
    Closed,

    /// A packet too large for its tag was enqueued without chunking.
    ///
    /// This is a local programmer error: the tag must be registered in the
    /// large-packet allow-list before oversized bodies can be sent.
    #[error("oversized packet '{tag}': {size} bytes exceeds limit {limit}")]
    Oversized {
        /// Command tag of the offending packet.
        tag: String,
        /// Serialized body size in bytes.
        size: usize,
        /// Configured chunk threshold.
        limit: usize,
    },
}

/// Result type alias using WireError.
pub type Result<T> = std::result::Result<T, WireError>;
