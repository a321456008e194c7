//! Error types for fluxvault-crypto

use fluxvault_core::SessionErrorKind;
use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    #[error("Signature verification failed")]
    SignatureVerificationFailed,

    #[error("Data too short: expected at least {expected} bytes, got {actual}")]
    DataTooShort { expected: usize, actual: usize },

    #[error("Nonce counter exhausted")]
    NonceExhausted,

    #[error("Invalid certificate signing request: {0}")]
    InvalidRequest(String),

    #[error("Certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("Certificate rejected: {0}")]
    CertificateRejected(String),

    #[error("Keystore error: {0}")]
    Keystore(String),
}

impl CryptoError {
    /// Map onto the session taxonomy
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            Self::EncryptionFailed(_)
            | Self::DecryptionFailed(_)
            | Self::InvalidKey(_)
            | Self::KeyExchangeFailed(_)
            | Self::DataTooShort { .. }
            | Self::NonceExhausted => SessionErrorKind::Handshake,
            Self::SignatureVerificationFailed => SessionErrorKind::SignatureVerification,
            Self::InvalidRequest(_) | Self::CertificateRejected(_) => {
                SessionErrorKind::InvalidRequest
            }
            Self::CertificateGeneration(_) | Self::Keystore(_) => SessionErrorKind::CommandFailed,
        }
    }
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_error_display() {
        let err = CryptoError::DecryptionFailed("corrupt ciphertext".to_string());
        assert!(format!("{}", err).contains("Decryption failed"));
        assert!(format!("{}", err).contains("corrupt ciphertext"));

        let err = CryptoError::DataTooShort {
            expected: 92,
            actual: 16,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("92"));
        assert!(msg.contains("16"));
    }

    #[test]
    fn test_crypto_error_kind() {
        assert_eq!(
            CryptoError::DecryptionFailed(String::new()).kind(),
            SessionErrorKind::Handshake
        );
        assert_eq!(
            CryptoError::SignatureVerificationFailed.kind(),
            SessionErrorKind::SignatureVerification
        );
        assert_eq!(
            CryptoError::InvalidRequest("no CN".into()).kind(),
            SessionErrorKind::InvalidRequest
        );
    }
}
