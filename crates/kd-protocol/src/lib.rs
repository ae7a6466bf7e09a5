//! kd-protocol: Docker multiplexed stream framing
//!
//! Container output delivered over a single connection (logs, exec, attach)
//! is split into frames that tell stdout and stderr apart. This crate holds
//! the byte-exact header format, a tokio codec for it, and the line-buffered
//! writer that produces frames from raw process output.

pub mod codec;
pub mod error;
pub mod frame;
pub mod mux;

pub use codec::{Frame, StreamCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, StreamType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use mux::{Multiplexer, MAX_LINE_BUFFER};
