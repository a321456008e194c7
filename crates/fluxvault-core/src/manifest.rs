//! Managed file specifications and content fingerprints

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a managed file is kept in sync on the agent
///
/// Only strict overwrite is implemented: the agent copy is replaced whenever
/// its fingerprint differs from the vault copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    StrictOverwrite,
}

/// Errors from validating managed file specifications
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Local path must be relative to the vault root: {0}")]
    LocalPathNotRelative(String),

    #[error("Path escapes its root: {0}")]
    PathTraversal(String),

    #[error("File names differ: local {local}, remote {remote}")]
    FileNameMismatch { local: String, remote: String },

    #[error("Path has no file name: {0}")]
    MissingFileName(String),
}

/// A keeper-side file designated for delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedFileSpec {
    /// Path relative to the vault root
    pub local_path: PathBuf,
    /// Destination on the agent, absolute or relative to its working directory.
    /// Defaults to the local file name in the working directory.
    #[serde(default)]
    pub remote_path: Option<PathBuf>,
    #[serde(default)]
    pub sync_mode: SyncMode,
}

impl ManagedFileSpec {
    /// Create a spec delivered to the same relative name on the agent
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            remote_path: None,
            sync_mode: SyncMode::StrictOverwrite,
        }
    }

    /// Set an explicit remote destination
    pub fn with_remote_path(mut self, remote_path: impl Into<PathBuf>) -> Self {
        self.remote_path = Some(remote_path.into());
        self
    }

    /// Check the path invariants
    ///
    /// The local path must stay inside the vault, a relative remote path must
    /// stay inside the working directory, and when both are given their file
    /// names must match.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.local_path.is_absolute() {
            return Err(ManifestError::LocalPathNotRelative(display(&self.local_path)));
        }
        ensure_contained(&self.local_path)?;
        let local_name = file_name(&self.local_path)?;

        if let Some(remote) = &self.remote_path {
            if remote.is_relative() {
                ensure_contained(remote)?;
            } else if remote.components().any(|c| c == Component::ParentDir) {
                return Err(ManifestError::PathTraversal(display(remote)));
            }
            let remote_name = file_name(remote)?;
            if local_name != remote_name {
                return Err(ManifestError::FileNameMismatch {
                    local: local_name,
                    remote: remote_name,
                });
            }
        }

        Ok(())
    }

    /// Name the agent requests this file by
    pub fn name(&self) -> String {
        display(&self.local_path)
    }

    /// Destination as sent to the agent
    pub fn remote_destination(&self) -> String {
        match &self.remote_path {
            Some(remote) => display(remote),
            None => display(&self.local_path),
        }
    }
}

/// Reject relative paths that climb out of their root
pub fn ensure_contained(path: &Path) -> Result<(), ManifestError> {
    let mut depth: usize = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| ManifestError::PathTraversal(display(path)))?;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ManifestError::PathTraversal(display(path)));
            }
        }
    }
    if depth == 0 {
        return Err(ManifestError::MissingFileName(display(path)));
    }
    Ok(())
}

fn file_name(path: &Path) -> Result<String, ManifestError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ManifestError::MissingFileName(display(path)))
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// BLAKE3 digest of file content, compared to decide whether to transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint a complete file body
    pub fn of(content: &[u8]) -> Self {
        Self(*blake3::hash(content).as_bytes())
    }

    /// Wrap a digest computed incrementally
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Lowercase hex form used on the wire
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the wire form
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}
