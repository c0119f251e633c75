//! Error types for the wire codec

use thiserror::Error;

/// Wire encoding and framing errors
#[derive(Debug, Error)]
pub enum WireError {
    /// Underlying stream failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Bytes could not be decoded into the expected record
    #[error("Decode error: {0}")]
    Decode(String),

    /// Frame length prefix exceeds the configured limit
    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Announced frame length
        len: usize,
        /// Configured limit
        max: usize,
    },

    /// Stream ended cleanly before a new frame started
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias
pub type WireResult<T> = Result<T, WireError>;
