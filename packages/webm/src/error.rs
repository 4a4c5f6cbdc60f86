//! Error types for WebM writing and EBML parsing.

use thiserror::Error;

/// Errors that can occur while writing or parsing a WebM file.
#[derive(Debug, Error)]
pub enum WebmError {
    /// Writer configuration was rejected.
    #[error("invalid writer config: {0}")]
    InvalidConfig(String),

    /// Codec name has no WebM codec ID mapping.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// Write attempted after `close()`.
    #[error("writer is closed")]
    Closed,

    /// Underlying file I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed EBML data.
    #[error("parse error: {0}")]
    Parse(String),
}

impl WebmError {
    /// Create an invalid-config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, WebmError>;
