//! Line-buffered stream multiplexer
//!
//! A [`Multiplexer`] turns raw process output into frames. Bytes are held
//! until a newline arrives and every completed line becomes one frame, so a
//! client reading the stream sees whole lines. Content without a newline is
//! emitted by [`Multiplexer::flush`], or as soon as it grows past
//! [`MAX_LINE_BUFFER`].
//!
//! stdout and stderr multiplexers that target the same connection share one
//! lock around the writer; a frame is written while holding it, so frames
//! from the two streams never interleave.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::codec::encode_frame;
use crate::error::ProtocolError;
use crate::frame::StreamType;

/// Unterminated output larger than this is emitted without waiting for a newline
pub const MAX_LINE_BUFFER: usize = 64 * 1024;

/// Read chunk size used by [`Multiplexer::pump`]
const PUMP_CHUNK_SIZE: usize = 8 * 1024;

/// Frames output of one stream type onto a (possibly shared) writer
pub struct Multiplexer<W> {
    stream: StreamType,
    writer: Arc<Mutex<W>>,
    buffer: BytesMut,
}

impl<W> Multiplexer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Create a multiplexer writing `stream` frames to `writer`
    pub fn new(stream: StreamType, writer: Arc<Mutex<W>>) -> Self {
        Self {
            stream,
            writer,
            buffer: BytesMut::new(),
        }
    }

    /// Create a stdout/stderr pair sharing one writer
    pub fn pair(writer: W) -> (Self, Self) {
        let writer = Arc::new(Mutex::new(writer));
        (
            Self::new(StreamType::Stdout, Arc::clone(&writer)),
            Self::new(StreamType::Stderr, writer),
        )
    }

    /// Stream type written by this multiplexer
    pub fn stream(&self) -> StreamType {
        self.stream
    }

    /// Shared writer handle, for building a sibling multiplexer
    pub fn writer(&self) -> Arc<Mutex<W>> {
        Arc::clone(&self.writer)
    }

    /// Buffer `data` and emit a frame for every completed line
    ///
    /// Always consumes all of `data`.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, ProtocolError> {
        self.buffer.extend_from_slice(data);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            self.emit(&line).await?;
        }

        if self.buffer.len() > MAX_LINE_BUFFER {
            let chunk = self.buffer.split();
            self.emit(&chunk).await?;
        }

        Ok(data.len())
    }

    /// Emit whatever is buffered as a final frame and flush the writer
    pub async fn flush(&mut self) -> Result<(), ProtocolError> {
        if !self.buffer.is_empty() {
            let chunk = self.buffer.split();
            self.emit(&chunk).await?;
        }

        self.writer.lock().await.flush().await?;
        Ok(())
    }

    /// Copy `reader` to the multiplexer until EOF, then flush
    pub async fn pump<R>(&mut self, mut reader: R) -> Result<u64, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = vec![0u8; PUMP_CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            self.write(&chunk[..n]).await?;
            total += n as u64;
        }

        self.flush().await?;
        Ok(total)
    }

    async fn emit(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        let mut frame = BytesMut::new();
        encode_frame(self.stream, payload, &mut frame)?;

        // write_all keeps going on short writes, so a frame is never split
        // by another writer holding the same lock.
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;

        tracing::trace!(stream = %self.stream, bytes = payload.len(), "frame written");
        Ok(())
    }
}
