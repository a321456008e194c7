//! Cryptographic primitives for FluxVault
//!
//! - [`session`]: per-connection X25519 key pair, session key wrapping and
//!   the counter-nonce frame cipher used once a session key is agreed
//! - [`signing`]: Ed25519 challenge signatures for keeper authentication
//! - [`ca`]: the keeper's in-memory certificate authority and the CSR side
//!   used by sub-agents
//! - [`keystore`]: signing key storage behind the
//!   [`KeyStore`](fluxvault_core::KeyStore) capability
//!
//! # Session key exchange
//!
//! ```ignore
//! use fluxvault_crypto::session::{generate_keypair, wrap_session_key, SessionKey};
//!
//! // Listener: fresh key pair per connection
//! let listener = generate_keypair();
//!
//! // Initiator: fresh session key wrapped under the listener's public key
//! let session_key = SessionKey::generate();
//! let wrapped = wrap_session_key(&session_key, &listener.public_bytes())?;
//!
//! // Listener: only the holder of the private half recovers it
//! let recovered = listener.unwrap_session_key(&wrapped)?;
//! ```

pub mod ca;
pub mod error;
pub mod keystore;
pub mod session;
pub mod signing;

pub use ca::{verify_leaf, CertificateAuthority, CertificateRequest, IssuedCertificate, LeafIdentity};
pub use error::{CryptoError, CryptoResult};
pub use keystore::{FileKeyStore, MemoryKeyStore};
pub use session::{
    generate_keypair, wrap_session_key, CipherRole, SessionCipher, SessionKey, SessionKeyPair,
    WrappedKey,
};
pub use signing::{challenge_nonce, generate_signing_key, sign_challenge, verify_challenge};
