//! The keeper's managed files
//!
//! Files are read from the vault directory when an agent asks for them; the
//! vault never writes. Every agent gets the shared files, and a sub-agent
//! also gets the files listed for its component name, which take precedence
//! when both lists name the same file.

use std::collections::BTreeMap;
use std::path::PathBuf;

use fluxvault_core::{FILE_CHUNK_SIZE, FileEntry, Fingerprint, ManagedFileSpec};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{KeeperError, KeeperResult};

/// Managed files rooted at the vault directory
#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
    shared: Vec<ManagedFileSpec>,
    components: BTreeMap<String, Vec<ManagedFileSpec>>,
}

impl Vault {
    pub fn new(
        root: impl Into<PathBuf>,
        shared: Vec<ManagedFileSpec>,
        components: BTreeMap<String, Vec<ManagedFileSpec>>,
    ) -> KeeperResult<Self> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(KeeperError::Config(format!(
                "vault root must be absolute, got {}",
                root.display()
            )));
        }
        for spec in shared.iter().chain(components.values().flatten()) {
            spec.validate()?;
        }
        Ok(Self {
            root,
            shared,
            components,
        })
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    /// Specs managed for `component`, component entries overriding shared ones
    fn specs(&self, component: Option<&str>) -> Vec<&ManagedFileSpec> {
        let mut specs: BTreeMap<String, &ManagedFileSpec> =
            self.shared.iter().map(|s| (s.name(), s)).collect();
        if let Some(extra) = component.and_then(|c| self.components.get(c)) {
            specs.extend(extra.iter().map(|s| (s.name(), s)));
        }
        specs.into_values().collect()
    }

    /// Manifest sent to the agent serving `component`
    pub fn manifest(&self, component: Option<&str>) -> Vec<FileEntry> {
        self.specs(component)
            .into_iter()
            .map(|spec| FileEntry {
                name: spec.name(),
                remote_path: spec.remote_destination(),
            })
            .collect()
    }

    /// Whether `name` is in the manifest for `component`
    pub fn manages(&self, component: Option<&str>, name: &str) -> bool {
        self.specs(component).iter().any(|s| s.name() == name)
    }

    /// Read a managed file, `None` if it is not in the vault
    pub async fn read(&self, component: Option<&str>, name: &str) -> KeeperResult<Option<VaultFile>> {
        let Some(spec) = self.specs(component).into_iter().find(|s| s.name() == name) else {
            return Ok(None);
        };
        let path = self.root.join(&spec.local_path);
        match tokio::fs::read(&path).await {
            Ok(content) => {
                let fingerprint = Fingerprint::of(&content);
                debug!(file = name, bytes = content.len(), "Read managed file");
                Ok(Some(VaultFile {
                    name: name.to_string(),
                    fingerprint,
                    content: Zeroizing::new(content),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// A managed file's content as read for one session
pub struct VaultFile {
    pub name: String,
    pub fingerprint: Fingerprint,
    content: Zeroizing<Vec<u8>>,
}

impl VaultFile {
    pub fn len(&self) -> u64 {
        self.content.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Chunk starting at `offset` and whether more follows
    pub fn chunk(&self, offset: u64) -> Option<(&[u8], bool)> {
        let start = usize::try_from(offset).ok()?;
        if start > self.content.len() || (start == self.content.len() && start != 0) {
            return None;
        }
        let end = (start + FILE_CHUNK_SIZE).min(self.content.len());
        Some((&self.content[start..end], end < self.content.len()))
    }
}

impl std::fmt::Debug for VaultFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultFile")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .field("len", &self.content.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vault(dir: &TempDir) -> Vault {
        let shared = vec![
            ManagedFileSpec::new("secret.txt"),
            ManagedFileSpec::new("app.env").with_remote_path("/etc/app/app.env"),
        ];
        let components = BTreeMap::from([(
            "componentb".to_string(),
            vec![
                ManagedFileSpec::new("db/password"),
                ManagedFileSpec::new("secret.txt").with_remote_path("/run/secret.txt"),
            ],
        )]);
        Vault::new(dir.path(), shared, components).unwrap()
    }

    #[test]
    fn test_manifest_per_component() {
        let dir = TempDir::new().unwrap();
        let vault = vault(&dir);

        let primary = vault.manifest(None);
        assert_eq!(primary.len(), 2);

        let sub = vault.manifest(Some("componentb"));
        assert_eq!(sub.len(), 3);
        let secret = sub.iter().find(|e| e.name == "secret.txt").unwrap();
        assert_eq!(secret.remote_path, "/run/secret.txt");
        assert!(vault.manages(Some("componentb"), "db/password"));
        assert!(!vault.manages(None, "db/password"));
    }

    #[tokio::test]
    async fn test_read_present_and_missing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("secret.txt"), b"hunter2").unwrap();
        let vault = vault(&dir);

        let file = vault.read(None, "secret.txt").await.unwrap().unwrap();
        assert_eq!(file.fingerprint, Fingerprint::of(b"hunter2"));
        assert_eq!(file.chunk(0), Some((&b"hunter2"[..], false)));
        assert!(file.chunk(7).is_none());

        assert!(vault.read(None, "app.env").await.unwrap().is_none());
        assert!(vault.read(None, "unmanaged").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunks_cover_large_file() {
        let dir = TempDir::new().unwrap();
        let content = vec![7u8; FILE_CHUNK_SIZE * 2 + 10];
        std::fs::write(dir.path().join("secret.txt"), &content).unwrap();
        let file = vault(&dir).read(None, "secret.txt").await.unwrap().unwrap();

        let (first, more) = file.chunk(0).unwrap();
        assert_eq!(first.len(), FILE_CHUNK_SIZE);
        assert!(more);
        let (last, more) = file.chunk((FILE_CHUNK_SIZE * 2) as u64).unwrap();
        assert_eq!(last.len(), 10);
        assert!(!more);
    }

    #[test]
    fn test_empty_file_has_one_chunk() {
        let file = VaultFile {
            name: "empty".into(),
            fingerprint: Fingerprint::of(b""),
            content: Zeroizing::new(Vec::new()),
        };
        assert_eq!(file.chunk(0), Some((&b""[..], false)));
    }
}
