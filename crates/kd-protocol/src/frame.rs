//! Frame header encoding/decoding
//!
//! The frame format uses an 8-byte header:
//! - stream_type: 1 byte (0 = stdin, 1 = stdout, 2 = stderr)
//! - reserved: 3 bytes, always zero
//! - payload_length: 4 bytes (u32, big-endian)

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size (limited by the 32-bit length field)
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

/// Which standard stream a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    /// Defined by the format but never written for output
    Stdin,
    Stdout,
    Stderr,
}

impl StreamType {
    /// Wire value of the stream type
    pub fn as_u8(self) -> u8 {
        match self {
            StreamType::Stdin => 0,
            StreamType::Stdout => 1,
            StreamType::Stderr => 2,
        }
    }

    /// Parse a wire value
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(StreamType::Stdin),
            1 => Some(StreamType::Stdout),
            2 => Some(StreamType::Stderr),
            _ => None,
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Stdin => write!(f, "stdin"),
            StreamType::Stdout => write!(f, "stdout"),
            StreamType::Stderr => write!(f, "stderr"),
        }
    }
}

/// Frame header containing stream type and length information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Stream the payload belongs to
    pub stream: StreamType,
    /// Length of the payload in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(stream: StreamType, payload_length: u32) -> Self {
        Self {
            stream,
            payload_length,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.stream.as_u8());
        dst.put_bytes(0, 3);
        dst.put_u32(self.payload_length);
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the header is invalid (unknown stream type or non-zero
    /// reserved bytes); nothing is consumed in that case.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let stream = StreamType::from_u8(src[0]).ok_or(ProtocolError::UnknownStreamType(src[0]))?;
        if src[1..4] != [0, 0, 0] {
            return Err(ProtocolError::InvalidHeader);
        }

        src.advance(4);
        let payload_length = src.get_u32();

        Ok(Some(Self {
            stream,
            payload_length,
        }))
    }
}
