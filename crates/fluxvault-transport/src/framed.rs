//! Frame-at-a-time reading and writing over an async stream

use bytes::BytesMut;
use fluxvault_core::{decode_frame, encode_frame, CodecError, FrameBuffer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::TransportResult;

/// Bytes requested from the stream per read
const READ_CHUNK: usize = 8 * 1024;

/// A byte stream carrying newline-delimited JSON frames
///
/// Reads never buffer more than one maximum-size frame plus one read chunk.
#[derive(Debug)]
pub struct FramedStream<S> {
    inner: S,
    buffer: FrameBuffer,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: FrameBuffer::new(),
        }
    }

    /// Read exactly one frame
    ///
    /// Returns `Ok(None)` on a clean end-of-stream at a frame boundary.
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> TransportResult<Option<T>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.buffer.next_frame()? {
                trace!(len = frame.len(), "Read frame");
                return Ok(Some(decode_frame(&frame)?));
            }

            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(CodecError::TruncatedFrame(self.buffer.len()).into());
            }
            self.buffer.push(&chunk[..n]);
        }
    }

    /// Write one frame and flush it
    pub async fn write_frame<T: Serialize>(&mut self, message: &T) -> TransportResult<()> {
        let bytes = encode_frame(message)?;
        trace!(len = bytes.len(), "Write frame");
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write half
    pub async fn shutdown(&mut self) -> TransportResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Release the stream together with any bytes read past the last frame
    pub fn into_parts(mut self) -> (S, BytesMut) {
        let leftover = self.buffer.take_remaining();
        (self.inner, leftover)
    }
}
