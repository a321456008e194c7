//! Error types for the keeper

use std::time::Duration;

use fluxvault_core::{InvalidTransition, ManifestError, SessionErrorKind};
use fluxvault_crypto::CryptoError;
use fluxvault_transport::TransportError;
use thiserror::Error;

/// Errors that can occur while delivering to agents
#[derive(Debug, Error)]
pub enum KeeperError {
    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Managed file specification invalid
    #[error("Invalid managed file: {0}")]
    Manifest(#[from] ManifestError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Signing key could not be read from the key store
    #[error("Key store error: {0}")]
    KeyStore(String),

    /// Could not open a connection to the agent
    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    /// The agent refused the keeper's credentials
    #[error("Rejected by agent")]
    Rejected { signature_required: bool },

    /// The agent answered a request with an error
    #[error("Agent error ({kind}): {message}")]
    Remote {
        kind: SessionErrorKind,
        message: String,
    },

    /// Peer sent something out of turn
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Session lifecycle violated
    #[error(transparent)]
    State(#[from] InvalidTransition),
}

impl KeeperError {
    /// Map onto the session taxonomy
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            Self::Transport(e) => e.kind(),
            Self::Crypto(e) => e.kind(),
            Self::Config(_) | Self::KeyStore(_) | Self::Io(_) => SessionErrorKind::CommandFailed,
            Self::Manifest(_) => SessionErrorKind::InvalidRequest,
            Self::Connect { .. } => SessionErrorKind::TransportLost,
            // An agent requiring signatures ignores the address allow-list
            Self::Rejected {
                signature_required: true,
            } => SessionErrorKind::SignatureVerification,
            Self::Rejected {
                signature_required: false,
            } => SessionErrorKind::UnauthorizedAddress,
            Self::Remote { kind, .. } => *kind,
            Self::Protocol(_) | Self::State(_) => SessionErrorKind::Framing,
            Self::Timeout(_) => SessionErrorKind::Timeout,
        }
    }
}

/// Result type for keeper operations
pub type KeeperResult<T> = Result<T, KeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_kind_follows_auth_mode() {
        assert_eq!(
            KeeperError::Rejected { signature_required: true }.kind(),
            SessionErrorKind::SignatureVerification
        );
        assert_eq!(
            KeeperError::Rejected { signature_required: false }.kind(),
            SessionErrorKind::UnauthorizedAddress
        );
    }

    #[test]
    fn test_remote_error_keeps_kind() {
        let err = KeeperError::Remote {
            kind: SessionErrorKind::TargetNotRegistered,
            message: "componentB".into(),
        };
        assert_eq!(err.kind(), SessionErrorKind::TargetNotRegistered);
        assert!(err.to_string().contains("componentB"));
    }
}
