//! Protocol error types

use thiserror::Error;

/// Errors that can occur while framing or unframing streams
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Reserved header bytes were not zero
    #[error("Invalid frame header")]
    InvalidHeader,

    /// Unknown stream type byte
    #[error("Unknown stream type: {0}")]
    UnknownStreamType(u8),

    /// Payload exceeds what the length field can carry
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// I/O error on the underlying connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
