//! Newline-delimited JSON framing
//!
//! Every frame is one JSON document followed by a single `\n`. JSON string
//! escaping guarantees a serialized value never contains a raw newline, so the
//! terminator is unambiguous. Frames are bounded by [`MAX_FRAME_SIZE`]; a peer
//! that sends more without a terminator is cut off before the buffer grows
//! past that bound.

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CodecError, CodecResult};

/// Maximum size of one frame in bytes, terminator included
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

const TERMINATOR: u8 = b'\n';

/// Encode a message as a single terminated frame
pub fn encode_frame<T: Serialize>(message: &T) -> CodecResult<Vec<u8>> {
    let mut bytes =
        serde_json::to_vec(message).map_err(|e| CodecError::Serialization(e.to_string()))?;
    bytes.push(TERMINATOR);

    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(bytes)
}

/// Decode one frame body (terminator already stripped)
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> CodecResult<T> {
    serde_json::from_slice(frame).map_err(|e| CodecError::MalformedMessage(e.to_string()))
}

/// Accumulates stream bytes and splits them into frames
///
/// Callers push whatever a read returned and then drain complete frames with
/// [`FrameBuffer::next_frame`] until it yields `None`.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
    /// Bytes already scanned for a terminator
    scanned: usize,
}

impl FrameBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the stream
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet returned as a frame
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether no bytes are buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Split off the next complete frame, without its terminator
    ///
    /// Returns `Ok(None)` when more bytes are needed, and
    /// [`CodecError::FrameTooLarge`] once the pending frame cannot fit.
    pub fn next_frame(&mut self) -> CodecResult<Option<BytesMut>> {
        let unscanned = &self.buf[self.scanned..];
        match unscanned.iter().position(|&b| b == TERMINATOR) {
            Some(pos) => {
                let end = self.scanned + pos;
                if end + 1 > MAX_FRAME_SIZE {
                    return Err(CodecError::FrameTooLarge {
                        size: end + 1,
                        max: MAX_FRAME_SIZE,
                    });
                }
                let frame = self.buf.split_to(end);
                self.buf.advance(1);
                self.scanned = 0;
                Ok(Some(frame))
            }
            None => {
                self.scanned = self.buf.len();
                if self.buf.len() >= MAX_FRAME_SIZE {
                    return Err(CodecError::FrameTooLarge {
                        size: self.buf.len(),
                        max: MAX_FRAME_SIZE,
                    });
                }
                Ok(None)
            }
        }
    }

    /// Take every buffered byte, leaving the buffer empty
    ///
    /// Used when a stream stops carrying frames and is handed to a raw relay.
    pub fn take_remaining(&mut self) -> BytesMut {
        self.scanned = 0;
        self.buf.split()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        tag: String,
        body: String,
    }

    #[test]
    fn test_embedded_newlines_are_escaped() {
        let note = Note {
            tag: "note".into(),
            body: "line one\nline two\n".into(),
        };
        let frame = encode_frame(&note).unwrap();

        assert_eq!(frame.iter().filter(|&&b| b == b'\n').count(), 1);
        assert_eq!(*frame.last().unwrap(), b'\n');

        let decoded: Note = decode_frame(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(decoded, note);
    }

    #[test]
    fn test_buffer_splits_multiple_frames() {
        let mut buffer = FrameBuffer::new();
        buffer.push(b"{\"tag\":\"a\",\"body\":\"1\"}\n{\"tag\":\"b\",");

        let first = buffer.next_frame().unwrap().unwrap();
        let first: Note = decode_frame(&first).unwrap();
        assert_eq!(first.tag, "a");

        assert!(buffer.next_frame().unwrap().is_none());

        buffer.push(b"\"body\":\"2\"}\n");
        let second: Note = decode_frame(&buffer.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(second.tag, "b");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_unterminated_oversized_frame_rejected() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&vec![b'a'; MAX_FRAME_SIZE]);

        let result = buffer.next_frame();
        assert!(matches!(result, Err(CodecError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_oversized_terminated_frame_rejected() {
        let mut buffer = FrameBuffer::new();
        let mut data = vec![b'a'; MAX_FRAME_SIZE + 10];
        data.push(b'\n');
        buffer.push(&data);

        assert!(matches!(
            buffer.next_frame(),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_message() {
        let note = Note {
            tag: "big".into(),
            body: "x".repeat(MAX_FRAME_SIZE),
        };
        assert!(matches!(
            encode_frame(&note),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_malformed_frame() {
        let result: CodecResult<Note> = decode_frame(b"{\"tag\": 5}");
        assert!(matches!(result, Err(CodecError::MalformedMessage(_))));

        let result: CodecResult<Note> = decode_frame(b"not json");
        assert!(matches!(result, Err(CodecError::MalformedMessage(_))));
    }

    #[test]
    fn test_take_remaining() {
        let mut buffer = FrameBuffer::new();
        buffer.push(b"{\"tag\":\"a\",\"body\":\"\"}\nraw bytes");
        buffer.next_frame().unwrap().unwrap();

        let rest = buffer.take_remaining();
        assert_eq!(&rest[..], b"raw bytes");
        assert!(buffer.is_empty());
    }
}
