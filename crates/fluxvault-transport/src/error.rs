//! Transport layer error types

use std::time::Duration;

use fluxvault_core::{CodecError, SessionErrorKind};
use fluxvault_crypto::CryptoError;
use thiserror::Error;

/// Unified transport error type
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Peer aborted the session")]
    Aborted,

    #[error("Unexpected envelope: {0}")]
    UnexpectedEnvelope(&'static str),

    #[error("Unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Map onto the session taxonomy
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            Self::Io(_) | Self::ConnectionClosed | Self::Aborted => SessionErrorKind::TransportLost,
            Self::Codec(e) => e.kind(),
            Self::Crypto(e) => e.kind(),
            Self::HandshakeFailed(_) | Self::Tls(_) => SessionErrorKind::Handshake,
            Self::UnexpectedEnvelope(_) | Self::UnexpectedMessage { .. } => {
                SessionErrorKind::Framing
            }
            Self::Timeout(_) => SessionErrorKind::Timeout,
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            TransportError::ConnectionClosed.kind(),
            SessionErrorKind::TransportLost
        );
        assert_eq!(
            TransportError::from(CodecError::MalformedMessage("x".into())).kind(),
            SessionErrorKind::Framing
        );
        assert_eq!(
            TransportError::from(CryptoError::DecryptionFailed("x".into())).kind(),
            SessionErrorKind::Handshake
        );
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(1)).kind(),
            SessionErrorKind::Timeout
        );
    }
}
