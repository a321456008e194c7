//! Challenge signatures for keeper authentication
//!
//! The agent issues a random nonce per connection; the keeper signs the nonce
//! prefixed with a fixed context string, so a signature can never be replayed
//! on another connection or confused with a signature over other data.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};

/// Size of an authentication challenge nonce
pub const CHALLENGE_SIZE: usize = 32;

const AUTH_CONTEXT: &[u8] = b"fluxvault-auth-v1";

/// Fresh random challenge for one connection
pub fn challenge_nonce() -> [u8; CHALLENGE_SIZE] {
    let mut nonce = [0u8; CHALLENGE_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

/// Generate a new Ed25519 signing key
pub fn generate_signing_key() -> SigningKey {
    let mut seed = Zeroizing::new([0u8; 32]);
    rand::rng().fill_bytes(&mut *seed);
    SigningKey::from_bytes(&*seed)
}

fn signed_bytes(nonce: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(AUTH_CONTEXT.len() + nonce.len());
    message.extend_from_slice(AUTH_CONTEXT);
    message.extend_from_slice(nonce);
    message
}

/// Sign an agent's challenge
pub fn sign_challenge(key: &SigningKey, nonce: &[u8]) -> Vec<u8> {
    key.sign(&signed_bytes(nonce)).to_bytes().to_vec()
}

/// Verify a challenge signature against a known identity
pub fn verify_challenge(
    verifying_key: &VerifyingKey,
    nonce: &[u8],
    signature: &[u8],
) -> CryptoResult<()> {
    let signature =
        Signature::from_slice(signature).map_err(|_| CryptoError::SignatureVerificationFailed)?;
    verifying_key
        .verify_strict(&signed_bytes(nonce), &signature)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = generate_signing_key();
        let nonce = challenge_nonce();

        let signature = sign_challenge(&key, &nonce);
        assert!(verify_challenge(&key.verifying_key(), &nonce, &signature).is_ok());
    }

    #[test]
    fn test_signature_bound_to_nonce() {
        let key = generate_signing_key();
        let signature = sign_challenge(&key, &challenge_nonce());

        let result = verify_challenge(&key.verifying_key(), &challenge_nonce(), &signature);
        assert!(matches!(result, Err(CryptoError::SignatureVerificationFailed)));
    }

    #[test]
    fn test_signature_bound_to_identity() {
        let key = generate_signing_key();
        let impostor = generate_signing_key();
        let nonce = challenge_nonce();

        let signature = sign_challenge(&impostor, &nonce);
        assert!(verify_challenge(&key.verifying_key(), &nonce, &signature).is_err());
    }

    #[test]
    fn test_raw_nonce_signature_rejected() {
        let key = generate_signing_key();
        let nonce = challenge_nonce();

        let bare = key.sign(&nonce).to_bytes();
        assert!(verify_challenge(&key.verifying_key(), &nonce, &bare).is_err());
        assert!(verify_challenge(&key.verifying_key(), &nonce, &[0u8; 12]).is_err());
    }
}
