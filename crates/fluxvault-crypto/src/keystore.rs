//! Signing key storage
//!
//! Two implementations of [`KeyStore`]: a directory of per-account key files
//! with owner-only permissions, and an in-memory store for tests and for
//! embedding FluxVault behind another secret manager.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use ed25519_dalek::SigningKey;
use fluxvault_core::KeyStore;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};

/// Extension of key files inside the store directory
const KEY_FILE_EXTENSION: &str = "key";

fn validate_account(account: &str) -> CryptoResult<()> {
    let valid = !account.is_empty()
        && account.len() <= 128
        && account
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
        && !account.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(CryptoError::Keystore(format!("invalid account name: {account:?}")))
    }
}

/// Key store persisting one file per account
pub struct FileKeyStore {
    /// Path to the keystore directory
    path: PathBuf,
}

impl FileKeyStore {
    /// Create a key store rooted at `dir`
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.to_path_buf(),
        }
    }

    fn key_path(&self, account: &str) -> PathBuf {
        self.path.join(format!("{account}.{KEY_FILE_EXTENSION}"))
    }

    /// Load the key for `account`, generating and saving one if absent
    pub fn load_or_generate(&self, account: &str) -> CryptoResult<SigningKey> {
        if let Some(key) = self.get_key(account)? {
            return Ok(key);
        }
        info!(account, "No signing key found, generating new key");
        let key = crate::signing::generate_signing_key();
        self.put_key(account, &key)?;
        Ok(key)
    }

    /// Write `bytes` to a file readable only by its owner
    ///
    /// New files are created 0600; an existing file is tightened before
    /// anything is written to it.
    fn write_private(path: &Path, bytes: &[u8]) -> CryptoResult<()> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(path)
            .map_err(|e| CryptoError::Keystore(format!("Failed to create key file: {}", e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(|e| CryptoError::Keystore(format!("Failed to set key permissions: {}", e)))?;
        }
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| CryptoError::Keystore(format!("Failed to write key file: {}", e)))
    }
}

impl KeyStore for FileKeyStore {
    type Error = CryptoError;

    fn get_key(&self, account: &str) -> CryptoResult<Option<SigningKey>> {
        validate_account(account)?;
        let key_path = self.key_path(account);
        if !key_path.exists() {
            return Ok(None);
        }

        let bytes = Zeroizing::new(
            std::fs::read(&key_path)
                .map_err(|e| CryptoError::Keystore(format!("Failed to read key file: {}", e)))?,
        );
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::Keystore(format!(
                "Invalid key file: expected 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        let seed = Zeroizing::new(seed);

        let key = SigningKey::from_bytes(&seed);
        debug!(account, "Loaded signing key from keystore");
        Ok(Some(key))
    }

    fn put_key(&self, account: &str, key: &SigningKey) -> CryptoResult<()> {
        validate_account(account)?;
        std::fs::create_dir_all(&self.path)
            .map_err(|e| CryptoError::Keystore(format!("Failed to create keystore dir: {}", e)))?;

        let key_path = self.key_path(account);
        let seed = Zeroizing::new(key.to_bytes());
        Self::write_private(&key_path, seed.as_slice())?;

        info!(account, path = %key_path.display(), "Saved signing key to keystore");
        Ok(())
    }
}

/// Key store held in process memory
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: DashMap<String, Zeroizing<[u8; 32]>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    type Error = CryptoError;

    fn get_key(&self, account: &str) -> CryptoResult<Option<SigningKey>> {
        Ok(self
            .keys
            .get(account)
            .map(|seed| SigningKey::from_bytes(&seed)))
    }

    fn put_key(&self, account: &str, key: &SigningKey) -> CryptoResult<()> {
        validate_account(account)?;
        self.keys
            .insert(account.to_string(), Zeroizing::new(key.to_bytes()));
        Ok(())
    }
}
