//! Per-connection session key exchange and frame encryption
//!
//! The listening side generates an X25519 key pair for every connection and
//! sends the public half in clear. The initiating side generates a random
//! session key and wraps it for that public key: a fresh ephemeral X25519
//! secret is combined with the listener's key, HKDF-SHA256 turns the shared
//! secret into a wrapping key, and ChaCha20-Poly1305 seals the session key.
//!
//! Once both sides hold the session key, [`SessionCipher`] seals every frame.
//! Nonces are a direction byte plus a per-direction counter, so a replayed,
//! dropped or reordered frame fails authentication.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, CryptoResult};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// Wrapped key layout: ephemeral public key, nonce, sealed session key
pub const WRAPPED_KEY_SIZE: usize = KEY_SIZE + NONCE_SIZE + KEY_SIZE + TAG_SIZE;

const WRAP_INFO: &[u8] = b"fluxvault session key wrap v1";

fn random_bytes<const N: usize>() -> Zeroizing<[u8; N]> {
    let mut bytes = Zeroizing::new([0u8; N]);
    rand::rng().fill_bytes(&mut *bytes);
    bytes
}

/// Symmetric key protecting one session
///
/// Zeroized when dropped; never serialized.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Generate a fresh random session key
    pub fn generate() -> Self {
        Self(*random_bytes::<KEY_SIZE>())
    }

    /// Create from raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes (use with caution)
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> CryptoResult<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(&self.0).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey([redacted])")
    }
}

/// Listener's per-connection X25519 key pair
pub struct SessionKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

/// Generate a fresh key pair for one incoming connection
pub fn generate_keypair() -> SessionKeyPair {
    SessionKeyPair::generate()
}

impl SessionKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::from(*random_bytes::<KEY_SIZE>());
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half, sent to the initiator in clear
    pub fn public_bytes(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Recover the session key the initiator wrapped for this key pair
    pub fn unwrap_session_key(&self, wrapped: &WrappedKey) -> CryptoResult<SessionKey> {
        let ephemeral_public = PublicKey::from(wrapped.ephemeral_public);
        let shared = self.secret.diffie_hellman(&ephemeral_public);
        if !shared.was_contributory() {
            return Err(CryptoError::KeyExchangeFailed(
                "non-contributory ephemeral key".to_string(),
            ));
        }

        let wrapping_key = derive_wrapping_key(
            shared.as_bytes(),
            &wrapped.ephemeral_public,
            self.public.as_bytes(),
        )?;
        let cipher = ChaCha20Poly1305::new_from_slice(&wrapping_key[..])
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&wrapped.nonce), wrapped.ciphertext.as_slice())
                .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?,
        );

        let bytes: [u8; KEY_SIZE] = plaintext.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "unwrapped key has {} bytes, expected {}",
                plaintext.len(),
                KEY_SIZE
            ))
        })?;
        Ok(SessionKey(bytes))
    }
}

impl fmt::Debug for SessionKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Session key sealed for one listener key pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub ephemeral_public: [u8; KEY_SIZE],
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl WrappedKey {
    /// Serialize as ephemeral public key, nonce, ciphertext
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(KEY_SIZE + NONCE_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.ephemeral_public);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Parse the layout produced by [`Self::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != WRAPPED_KEY_SIZE {
            return Err(CryptoError::DataTooShort {
                expected: WRAPPED_KEY_SIZE,
                actual: bytes.len(),
            });
        }

        let mut ephemeral_public = [0u8; KEY_SIZE];
        ephemeral_public.copy_from_slice(&bytes[..KEY_SIZE]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[KEY_SIZE..KEY_SIZE + NONCE_SIZE]);

        Ok(Self {
            ephemeral_public,
            nonce,
            ciphertext: bytes[KEY_SIZE + NONCE_SIZE..].to_vec(),
        })
    }
}

/// Wrap `key` so only the holder of `recipient_public`'s secret can read it
pub fn wrap_session_key(key: &SessionKey, recipient_public: &[u8]) -> CryptoResult<WrappedKey> {
    let recipient: [u8; KEY_SIZE] = recipient_public.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!(
            "public key has {} bytes, expected {}",
            recipient_public.len(),
            KEY_SIZE
        ))
    })?;
    let recipient = PublicKey::from(recipient);

    let ephemeral = StaticSecret::from(*random_bytes::<KEY_SIZE>());
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::KeyExchangeFailed(
            "non-contributory listener key".to_string(),
        ));
    }

    let wrapping_key =
        derive_wrapping_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes())?;
    let cipher = ChaCha20Poly1305::new_from_slice(&wrapping_key[..])
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), key.as_bytes().as_slice())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok(WrappedKey {
        ephemeral_public: ephemeral_public.to_bytes(),
        nonce,
        ciphertext,
    })
}

fn derive_wrapping_key(
    shared: &[u8; KEY_SIZE],
    ephemeral_public: &[u8; KEY_SIZE],
    recipient_public: &[u8; KEY_SIZE],
) -> CryptoResult<Zeroizing<[u8; KEY_SIZE]>> {
    let mut salt = [0u8; KEY_SIZE * 2];
    salt[..KEY_SIZE].copy_from_slice(ephemeral_public);
    salt[KEY_SIZE..].copy_from_slice(recipient_public);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(WRAP_INFO, &mut *okm)
        .map_err(|e| CryptoError::KeyExchangeFailed(e.to_string()))?;
    Ok(okm)
}

/// Which end of the handshake a cipher belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherRole {
    Listener,
    Initiator,
}

impl CipherRole {
    fn send_direction(self) -> u8 {
        match self {
            Self::Listener => 0x01,
            Self::Initiator => 0x02,
        }
    }

    fn recv_direction(self) -> u8 {
        match self {
            Self::Listener => 0x02,
            Self::Initiator => 0x01,
        }
    }
}

/// Seals and opens the frames of one session
///
/// Both directions keep their own counter. The peer's cipher must be built
/// with the opposite role.
pub struct SessionCipher {
    key: SessionKey,
    role: CipherRole,
    send_counter: u64,
    recv_counter: u64,
}

impl SessionCipher {
    pub fn new(key: SessionKey, role: CipherRole) -> Self {
        Self {
            key,
            role,
            send_counter: 0,
            recv_counter: 0,
        }
    }

    pub fn role(&self) -> CipherRole {
        self.role
    }

    fn nonce(direction: u8, counter: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0] = direction;
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Encrypt the next outgoing frame
    pub fn seal(&mut self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let counter = self.send_counter;
        self.send_counter = counter.checked_add(1).ok_or(CryptoError::NonceExhausted)?;

        let nonce = Self::nonce(self.role.send_direction(), counter);
        self.key
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// Decrypt the next incoming frame
    ///
    /// The receive counter only advances on success, but any failure is
    /// fatal to the session anyway.
    pub fn open(&mut self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::DataTooShort {
                expected: TAG_SIZE,
                actual: ciphertext.len(),
            });
        }

        let nonce = Self::nonce(self.role.recv_direction(), self.recv_counter);
        let plaintext = self
            .key
            .cipher()?
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        self.recv_counter = self
            .recv_counter
            .checked_add(1)
            .ok_or(CryptoError::NonceExhausted)?;
        Ok(plaintext)
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCipher")
            .field("role", &self.role)
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_recovers_key() {
        for _ in 0..16 {
            let keypair = generate_keypair();
            let key = SessionKey::generate();

            let wrapped = wrap_session_key(&key, &keypair.public_bytes()).unwrap();
            let recovered = keypair.unwrap_session_key(&wrapped).unwrap();
            assert_eq!(recovered, key);
        }
    }

    #[test]
    fn test_unwrap_with_wrong_keypair_fails() {
        let intended = generate_keypair();
        let other = generate_keypair();
        let key = SessionKey::generate();

        let wrapped = wrap_session_key(&key, &intended.public_bytes()).unwrap();
        assert!(matches!(
            other.unwrap_session_key(&wrapped),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_keypairs_are_fresh() {
        assert_ne!(generate_keypair().public_bytes(), generate_keypair().public_bytes());
    }

    #[test]
    fn test_wrapped_key_bytes() {
        let keypair = generate_keypair();
        let wrapped = wrap_session_key(&SessionKey::generate(), &keypair.public_bytes()).unwrap();

        let bytes = wrapped.to_bytes();
        assert_eq!(bytes.len(), WRAPPED_KEY_SIZE);
        assert_eq!(WrappedKey::from_bytes(&bytes).unwrap(), wrapped);

        assert!(matches!(
            WrappedKey::from_bytes(&bytes[..10]),
            Err(CryptoError::DataTooShort { .. })
        ));
    }

    #[test]
    fn test_tampered_wrapped_key_fails() {
        let keypair = generate_keypair();
        let mut wrapped = wrap_session_key(&SessionKey::generate(), &keypair.public_bytes()).unwrap();
        wrapped.ciphertext[0] ^= 0xff;
        assert!(keypair.unwrap_session_key(&wrapped).is_err());
    }

    #[test]
    fn test_wrap_rejects_bad_public_key_length() {
        let result = wrap_session_key(&SessionKey::generate(), &[0u8; 31]);
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_cipher_roundtrip_both_directions() {
        let key = SessionKey::generate();
        let mut listener = SessionCipher::new(key.clone(), CipherRole::Listener);
        let mut initiator = SessionCipher::new(key, CipherRole::Initiator);

        let sealed = listener.seal(b"probe").unwrap();
        assert_eq!(initiator.open(&sealed).unwrap(), b"probe");

        let sealed = initiator.seal(b"reply").unwrap();
        assert_eq!(listener.open(&sealed).unwrap(), b"reply");
    }

    #[test]
    fn test_replayed_frame_rejected() {
        let key = SessionKey::generate();
        let mut listener = SessionCipher::new(key.clone(), CipherRole::Listener);
        let mut initiator = SessionCipher::new(key, CipherRole::Initiator);

        let first = listener.seal(b"one").unwrap();
        initiator.open(&first).unwrap();
        assert!(initiator.open(&first).is_err());
    }

    #[test]
    fn test_reordered_frames_rejected() {
        let key = SessionKey::generate();
        let mut listener = SessionCipher::new(key.clone(), CipherRole::Listener);
        let mut initiator = SessionCipher::new(key, CipherRole::Initiator);

        let _first = listener.seal(b"one").unwrap();
        let second = listener.seal(b"two").unwrap();
        assert!(initiator.open(&second).is_err());
    }

    #[test]
    fn test_reflected_frame_rejected() {
        let key = SessionKey::generate();
        let mut listener = SessionCipher::new(key.clone(), CipherRole::Listener);
        let mut other_listener = SessionCipher::new(key, CipherRole::Listener);

        let sealed = listener.seal(b"own frame").unwrap();
        assert!(other_listener.open(&sealed).is_err());
    }

    #[test]
    fn test_wrong_session_key_rejected() {
        let mut listener = SessionCipher::new(SessionKey::generate(), CipherRole::Listener);
        let mut initiator = SessionCipher::new(SessionKey::generate(), CipherRole::Initiator);

        let sealed = listener.seal(b"probe").unwrap();
        assert!(matches!(
            initiator.open(&sealed),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }
}
