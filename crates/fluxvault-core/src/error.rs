//! Error types shared across FluxVault crates

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of every failure a session can hit
///
/// Each crate-specific error maps onto exactly one kind. The kind decides
/// whether the session survives, whether the event is security relevant, and
/// is the only part of a failure that is ever shown to the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorKind {
    /// Oversized or unterminated frame, or a frame that does not parse
    Framing,
    /// Key wrap/unwrap failure or probe mismatch
    Handshake,
    /// Peer address is not on the allow-list
    UnauthorizedAddress,
    /// Challenge signature did not verify against the claimed identity
    SignatureVerification,
    /// Malformed request payload (CSR, plugin bundle, file name)
    InvalidRequest,
    /// Plugin failed to install or register
    PluginLoad,
    /// Transport closed or failed mid-session
    TransportLost,
    /// Proxy target is not in the registrar table
    TargetNotRegistered,
    /// Session exceeded its deadline
    Timeout,
    /// Requested file does not exist on the responding side
    NotFound,
    /// Command or plugin invocation failed at runtime
    CommandFailed,
}

impl SessionErrorKind {
    /// Whether this failure ends the session
    ///
    /// Request-scoped failures leave the session usable for the next
    /// request/response pair.
    pub fn is_fatal(self) -> bool {
        !matches!(
            self,
            Self::InvalidRequest
                | Self::PluginLoad
                | Self::TargetNotRegistered
                | Self::NotFound
                | Self::CommandFailed
        )
    }

    /// Whether this failure must be logged as a security event
    pub fn is_security_event(self) -> bool {
        matches!(
            self,
            Self::Handshake | Self::UnauthorizedAddress | Self::SignatureVerification
        )
    }

    /// Whether the detail of this failure may be shared with the remote peer
    ///
    /// Cryptographic and authentication failures are reported uniformly.
    pub fn is_disclosable(self) -> bool {
        !self.is_security_event()
    }

    /// Stable short name used in logs and reports
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Framing => "framing",
            Self::Handshake => "handshake",
            Self::UnauthorizedAddress => "unauthorized_address",
            Self::SignatureVerification => "signature_verification",
            Self::InvalidRequest => "invalid_request",
            Self::PluginLoad => "plugin_load",
            Self::TransportLost => "transport_lost",
            Self::TargetNotRegistered => "target_not_registered",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::CommandFailed => "command_failed",
        }
    }
}

impl std::fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while framing or parsing wire messages
#[derive(Debug, Error)]
pub enum CodecError {
    /// No terminator found within the frame bound
    #[error("Frame exceeds maximum size: {size} bytes > {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Frame could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Frame did not parse into the expected shape
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Stream ended in the middle of a frame
    #[error("Stream ended with {0} bytes of an unterminated frame")]
    TruncatedFrame(usize),
}

impl CodecError {
    /// Map onto the session taxonomy
    pub fn kind(&self) -> SessionErrorKind {
        SessionErrorKind::Framing
    }
}

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;
