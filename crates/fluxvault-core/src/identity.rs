//! Identities and the external collaborators that supply them
//!
//! The directory services and key storage live outside FluxVault. These
//! traits are the seams they plug into; the static implementations here back
//! configuration files and tests.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{SigningKey, VerifyingKey};
use tracing::debug;

/// A public identity used to verify signed challenges
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    /// Human-readable account identifier
    pub account: String,
    /// Ed25519 verification key
    pub verifying_key: VerifyingKey,
}

impl Identity {
    pub fn new(account: impl Into<String>, verifying_key: VerifyingKey) -> Self {
        Self {
            account: account.into(),
            verifying_key,
        }
    }

    /// Parse a base64-encoded 32-byte Ed25519 public key
    pub fn from_base64(account: impl Into<String>, key: &str) -> Option<Self> {
        let bytes = STANDARD.decode(key.trim()).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        let verifying_key = VerifyingKey::from_bytes(&array).ok()?;
        Some(Self::new(account, verifying_key))
    }

    /// Base64 form of the public key
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.verifying_key.as_bytes())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("account", &self.account)
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

/// Public-identity lookup keyed by account
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Return the identity for `account`, or `None` if unknown
    async fn lookup(&self, account: &str) -> Option<Identity>;
}

/// Directory returning the network addresses of a named application
#[async_trait]
pub trait AddressDirectory: Send + Sync {
    async fn addresses(&self, app_name: &str) -> Vec<String>;
}

/// Secure local storage of signing keys
pub trait KeyStore: Send + Sync {
    /// Error raised by the backing store
    type Error: std::error::Error + Send + Sync + 'static;

    /// Signing key for `account`, `Ok(None)` if none is stored
    fn get_key(&self, account: &str) -> Result<Option<SigningKey>, Self::Error>;

    /// Store (or replace) the signing key for `account`
    fn put_key(&self, account: &str, key: &SigningKey) -> Result<(), Self::Error>;
}

/// Identity directory backed by a fixed table
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityDirectory {
    identities: HashMap<String, Identity>,
}

impl StaticIdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity, replacing any previous one for the same account
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identities.insert(identity.account.clone(), identity);
        self
    }

    pub fn insert(&mut self, identity: Identity) {
        self.identities.insert(identity.account.clone(), identity);
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[async_trait]
impl IdentityDirectory for StaticIdentityDirectory {
    async fn lookup(&self, account: &str) -> Option<Identity> {
        let found = self.identities.get(account).cloned();
        debug!(account, found = found.is_some(), "Identity lookup");
        found
    }
}

/// Address directory backed by a fixed list
///
/// Every application name resolves to the same addresses, matching a keeper
/// configured with an explicit agent list.
#[derive(Debug, Clone, Default)]
pub struct StaticAddressDirectory {
    addresses: Vec<String>,
}

impl StaticAddressDirectory {
    pub fn new(addresses: Vec<String>) -> Self {
        Self { addresses }
    }
}

#[async_trait]
impl AddressDirectory for StaticAddressDirectory {
    async fn addresses(&self, _app_name: &str) -> Vec<String> {
        self.addresses.clone()
    }
}
