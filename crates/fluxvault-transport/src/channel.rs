//! Encrypted message channel
//!
//! After the handshake every [`Message`] travels as an [`Envelope::Sealed`]
//! frame. The only cleartext frame either side may still send is
//! [`Envelope::Abort`].

use fluxvault_core::{decode_frame, CodecError, Envelope, Message, MAX_FRAME_SIZE};
use fluxvault_crypto::SessionCipher;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::error::{TransportError, TransportResult};
use crate::framed::FramedStream;

/// Bytes a sealed envelope adds around the base64 ciphertext, terminator included
const SEALED_OVERHEAD: usize = 45;

const TAG_SIZE: usize = 16;

/// Size of the frame carrying `plaintext_len` bytes once sealed
fn sealed_frame_len(plaintext_len: usize) -> usize {
    4 * (plaintext_len + TAG_SIZE).div_ceil(3) + SEALED_OVERHEAD
}

/// One session's encrypted, strictly sequential message channel
pub struct SecureChannel<S> {
    framed: FramedStream<S>,
    cipher: SessionCipher,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(framed: FramedStream<S>, cipher: SessionCipher) -> Self {
        Self { framed, cipher }
    }

    /// Seal and send one message
    ///
    /// A message too large for one frame is refused before it is sealed, so
    /// the session stays usable.
    pub async fn send(&mut self, message: &Message) -> TransportResult<()> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(message).map_err(|e| CodecError::Serialization(e.to_string()))?,
        );
        let size = sealed_frame_len(plaintext.len());
        if size > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            }
            .into());
        }
        let ciphertext = self.cipher.seal(&plaintext)?;
        trace!(tag = message.tag(), "Send");
        self.framed
            .write_frame(&Envelope::Sealed { ciphertext })
            .await
    }

    /// Receive and open one message
    pub async fn recv(&mut self) -> TransportResult<Message> {
        match self.framed.read_frame::<Envelope>().await? {
            Some(Envelope::Sealed { ciphertext }) => {
                let plaintext = Zeroizing::new(self.cipher.open(&ciphertext)?);
                let message: Message = decode_frame(&plaintext)?;
                trace!(tag = message.tag(), "Recv");
                Ok(message)
            }
            Some(Envelope::Abort) => Err(TransportError::Aborted),
            Some(other) => Err(TransportError::UnexpectedEnvelope(other.tag())),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    /// Send a request and wait for its response
    pub async fn request(&mut self, message: &Message) -> TransportResult<Message> {
        self.send(message).await?;
        self.recv().await
    }

    /// Signal failure to the peer without detail, ignoring write errors
    pub async fn abort(&mut self) {
        if let Err(e) = self.framed.write_frame(&Envelope::Abort).await {
            debug!(error = %e, "Failed to send abort");
        }
        let _ = self.framed.shutdown().await;
    }

    /// Flush and close the write half
    pub async fn shutdown(&mut self) -> TransportResult<()> {
        self.framed.shutdown().await
    }

    pub fn get_ref(&self) -> &S {
        self.framed.get_ref()
    }

    /// Drop the session key and hand back the framed stream
    ///
    /// Used when the stream stops carrying this session, for example when a
    /// primary agent turns it into a relay.
    pub fn into_framed(self) -> FramedStream<S> {
        self.framed
    }
}

impl<S> std::fmt::Debug for SecureChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::{accept_handshake, initiate_handshake};
    use fluxvault_core::encode_frame;
    use tokio::io::duplex;

    #[test]
    fn test_sealed_frame_len_matches_encoding() {
        for len in [0usize, 1, 2, 3, 100, 4096] {
            let envelope = Envelope::Sealed {
                ciphertext: vec![0u8; len + TAG_SIZE],
            };
            assert_eq!(encode_frame(&envelope).unwrap().len(), sealed_frame_len(len));
        }
    }

    #[tokio::test]
    async fn test_oversized_message_refused_and_session_survives() {
        let (a, b) = duplex(256 * 1024);
        let listener = tokio::spawn(async move {
            let mut channel = accept_handshake(FramedStream::new(a)).await.unwrap();
            channel.recv().await.unwrap()
        });
        let mut channel = initiate_handshake(FramedStream::new(b)).await.unwrap();

        let huge = Message::InvokeResult {
            command: "dump".into(),
            output: serde_json::Value::String("x".repeat(MAX_FRAME_SIZE)),
        };
        let err = channel.send(&huge).await.unwrap_err();
        assert!(matches!(err, TransportError::Codec(CodecError::FrameTooLarge { .. })));

        channel.send(&Message::Ack).await.unwrap();
        assert_eq!(listener.await.unwrap(), Message::Ack);
    }
}
