//! Tokio codec for multiplexed stream frames

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, StreamType, MAX_PAYLOAD_SIZE};

/// A complete frame with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Stream this frame belongs to
    pub stream: StreamType,
    /// Raw payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(stream: StreamType, payload: impl Into<Bytes>) -> Self {
        Self {
            stream,
            payload: payload.into(),
        }
    }
}

/// Codec for encoding/decoding stream frames
#[derive(Debug, Default)]
pub struct StreamCodec {
    /// Current header being decoded (if any)
    pending_header: Option<FrameHeader>,
}

impl StreamCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for StreamCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header.take() {
            Some(h) => h,
            None => match FrameHeader::decode(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_length as usize;
        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame {
            stream: header.stream,
            payload,
        }))
    }
}

impl Encoder<Frame> for StreamCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(frame.stream, &frame.payload, dst)
    }
}

/// Append one framed payload to `dst`
pub(crate) fn encode_frame(
    stream: StreamType,
    payload: &[u8],
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    dst.reserve(payload.len());
    FrameHeader::new(stream, payload.len() as u32).encode(dst);
    dst.extend_from_slice(payload);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::HEADER_SIZE;

    #[test]
    fn test_codec_stdout_frame() {
        let mut codec = StreamCodec::new();

        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(StreamType::Stdout, "Hello, world!\n"), &mut buf)
            .unwrap();

        assert_eq!(buf.len(), HEADER_SIZE + 14);
        assert_eq!(buf[0], 1);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.stream, StreamType::Stdout);
        assert_eq!(decoded.payload.as_ref(), b"Hello, world!\n");
    }

    #[test]
    fn test_codec_partial_read() {
        let mut codec = StreamCodec::new();

        let mut full_buf = BytesMut::new();
        codec
            .encode(Frame::new(StreamType::Stderr, "boom"), &mut full_buf)
            .unwrap();

        // Header complete, payload missing
        let mut partial = full_buf.split_to(HEADER_SIZE + 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full_buf);

        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, Frame::new(StreamType::Stderr, "boom"));
    }

    #[test]
    fn test_codec_back_to_back_frames() {
        let mut codec = StreamCodec::new();

        let mut buf = BytesMut::new();
        codec.encode(Frame::new(StreamType::Stdout, "a\n"), &mut buf).unwrap();
        codec.encode(Frame::new(StreamType::Stderr, "b\n"), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.stream, StreamType::Stdout);
        assert_eq!(second.stream, StreamType::Stderr);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
