//! Writing delivered files into the working directory
//!
//! A file arrives in chunks. They are appended to a hidden sibling of the
//! destination and the sibling is renamed over the destination only after the
//! last chunk, once the content matches the fingerprint the keeper announced.
//! A failed or abandoned transfer never leaves a partial destination file.

use std::path::{Component, Path, PathBuf};

use fluxvault_core::{ensure_contained, Fingerprint, ManifestError};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};

/// Resolves and fingerprints files under the working directory
#[derive(Debug, Clone)]
pub struct FileStore {
    working_dir: PathBuf,
}

impl FileStore {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Absolute destination for a remote path from the manifest
    ///
    /// Relative paths must stay inside the working directory; absolute paths
    /// may not contain `..`.
    pub fn resolve(&self, remote_path: &str) -> AgentResult<PathBuf> {
        let path = Path::new(remote_path);
        if path.is_absolute() {
            if path.components().any(|c| c == Component::ParentDir) || path.file_name().is_none() {
                return Err(ManifestError::PathTraversal(remote_path.to_string()).into());
            }
            return Ok(path.to_path_buf());
        }
        ensure_contained(path)?;
        Ok(self.working_dir.join(path))
    }

    /// Fingerprint of the current copy, `None` if there is none
    pub async fn fingerprint(&self, path: &Path) -> AgentResult<Option<Fingerprint>> {
        match fs::read(path).await {
            Ok(content) => Ok(Some(Fingerprint::of(&content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Start receiving a file destined for `target`
    pub async fn begin(&self, target: PathBuf, expected: Fingerprint, total: u64) -> AgentResult<PendingFile> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp = temp_sibling(&target)?;
        let file = create_private(&temp).await?;
        debug!(path = %target.display(), total, "Receiving file");
        Ok(PendingFile {
            target,
            temp,
            file: Some(file),
            hasher: blake3::Hasher::new(),
            expected,
            total,
            written: 0,
        })
    }
}

fn temp_sibling(target: &Path) -> AgentResult<PathBuf> {
    let name = target
        .file_name()
        .ok_or_else(|| AgentError::InvalidRequest(format!("no file name in {}", target.display())))?;
    let mut temp_name = std::ffi::OsString::from(".");
    temp_name.push(name);
    temp_name.push(".fluxvault-partial");
    Ok(target.with_file_name(temp_name))
}

/// Create or truncate `path`, readable only by its owner from the start
pub(crate) async fn create_private(path: &Path) -> AgentResult<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let file = options.open(path).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(file)
}

/// A file being received chunk by chunk
#[derive(Debug)]
pub struct PendingFile {
    target: PathBuf,
    temp: PathBuf,
    file: Option<File>,
    hasher: blake3::Hasher,
    expected: Fingerprint,
    total: u64,
    written: u64,
}

impl PendingFile {
    /// Offset the next chunk must start at
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Append one chunk; chunks must arrive in order
    pub async fn write_chunk(&mut self, offset: u64, data: &[u8]) -> AgentResult<()> {
        if offset != self.written {
            return Err(AgentError::Protocol(format!(
                "chunk at offset {offset}, expected {}",
                self.written
            )));
        }
        let end = self.written + data.len() as u64;
        if end > self.total {
            return Err(AgentError::Protocol(format!(
                "chunk ends at {end}, past announced size {}",
                self.total
            )));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| AgentError::Protocol("file already finished".into()))?;
        file.write_all(data).await?;
        self.hasher.update(data);
        self.written = end;
        Ok(())
    }

    /// Verify the content and move it into place
    pub async fn finish(mut self) -> AgentResult<PathBuf> {
        if self.written != self.total {
            let reason = format!("received {} of {} bytes", self.written, self.total);
            self.discard().await;
            return Err(AgentError::Protocol(reason));
        }
        let actual = Fingerprint::from_bytes(*self.hasher.finalize().as_bytes());
        if actual != self.expected {
            warn!(path = %self.target.display(), expected = %self.expected, actual = %actual, "Delivered content does not match fingerprint");
            self.discard().await;
            return Err(AgentError::InvalidRequest("content does not match fingerprint".into()));
        }

        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        fs::rename(&self.temp, &self.target).await?;
        Ok(self.target.clone())
    }

    /// Remove the partial file
    pub async fn discard(&mut self) {
        self.file.take();
        if let Err(e) = fs::remove_file(&self.temp).await {
            debug!(path = %self.temp.display(), error = %e, "Failed to remove partial file");
        }
    }
}
