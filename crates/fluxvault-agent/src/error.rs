//! Error types for the agent

use std::time::Duration;

use fluxvault_core::{InvalidTransition, ManifestError, SessionErrorKind};
use fluxvault_crypto::CryptoError;
use fluxvault_transport::TransportError;
use thiserror::Error;

/// Errors that can occur while serving keeper sessions
#[derive(Debug, Error)]
pub enum AgentError {
    /// Transport layer error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer address is not on the allow-list
    #[error("Address not authorized: {0}")]
    UnauthorizedAddress(String),

    /// Challenge signature missing or wrong
    #[error("Signature verification failed: {0}")]
    SignatureVerification(String),

    /// Malformed or unsupported request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Path in a request escapes its root
    #[error("Invalid path: {0}")]
    Path(#[from] ManifestError),

    /// Plugin failed to install or register
    #[error("Plugin load failed: {0}")]
    PluginLoad(String),

    /// Plugin command or exec failed at runtime
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Proxy target not in the registrar table
    #[error("Target not registered: {0}")]
    TargetNotRegistered(String),

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

impl AgentError {
    /// Map onto the session taxonomy
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            Self::Transport(e) => e.kind(),
            Self::Crypto(e) => e.kind(),
            Self::Config(_) | Self::CommandFailed(_) => SessionErrorKind::CommandFailed,
            Self::Io(_) => SessionErrorKind::CommandFailed,
            Self::UnauthorizedAddress(_) => SessionErrorKind::UnauthorizedAddress,
            Self::SignatureVerification(_) => SessionErrorKind::SignatureVerification,
            Self::InvalidRequest(_) | Self::Path(_) => SessionErrorKind::InvalidRequest,
            Self::PluginLoad(_) => SessionErrorKind::PluginLoad,
            Self::TargetNotRegistered(_) => SessionErrorKind::TargetNotRegistered,
            Self::Protocol(_) | Self::State(_) => SessionErrorKind::Framing,
            Self::Timeout(_) => SessionErrorKind::Timeout,
        }
    }
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_scoped_errors_are_not_fatal() {
        assert!(!AgentError::PluginLoad("x".into()).kind().is_fatal());
        assert!(!AgentError::TargetNotRegistered("componentB".into()).kind().is_fatal());
        assert!(!AgentError::Path(ManifestError::PathTraversal("../x".into())).kind().is_fatal());
        assert!(AgentError::UnauthorizedAddress("10.0.0.9".into()).kind().is_fatal());
        assert!(AgentError::Transport(TransportError::ConnectionClosed).kind().is_fatal());
    }
}
