//! Certificate enrollment state of an agent
//!
//! A sub-agent starts unenrolled. The keeper has it generate a key pair and
//! CSR, signs the CSR, and sends back the certificate together with the
//! authority's root. From then on every accepted connection must complete
//! mutual TLS against that root before the session handshake starts.
//!
//! The installed identity is written under the agent's state directory so it
//! survives restarts.

use std::path::{Path, PathBuf};

use fluxvault_crypto::{verify_leaf, CertificateRequest};
use fluxvault_transport::{TlsAcceptor, TlsIdentity};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{AgentError, AgentResult};
use crate::files::create_private;

const CERT_FILE: &str = "agent.crt";
const KEY_FILE: &str = "agent.key";
const CA_FILE: &str = "ca.crt";

/// The agent's TLS identity, if enrolled
pub struct Enrollment {
    dir: PathBuf,
    acceptor: RwLock<Option<TlsAcceptor>>,
    certificate: watch::Sender<Option<String>>,
}

impl Enrollment {
    /// Load a previously installed identity from `dir`, if any
    pub async fn load(dir: impl Into<PathBuf>) -> AgentResult<Self> {
        let dir = dir.into();
        let (certificate, _) = watch::channel(None);
        let enrollment = Self {
            dir,
            acceptor: RwLock::new(None),
            certificate,
        };

        if let Some(identity) = read_identity(&enrollment.dir).await? {
            let acceptor = TlsAcceptor::new(&identity)?;
            *enrollment.acceptor.write().await = Some(acceptor);
            enrollment
                .certificate
                .send_replace(Some(identity.certificate_pem.clone()));
            info!(dir = %enrollment.dir.display(), "Loaded installed certificate");
        }
        Ok(enrollment)
    }

    pub async fn is_enrolled(&self) -> bool {
        self.acceptor.read().await.is_some()
    }

    /// Acceptor for incoming connections, once enrolled
    pub async fn acceptor(&self) -> Option<TlsAcceptor> {
        self.acceptor.read().await.clone()
    }

    /// Follow certificate installs
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.certificate.subscribe()
    }

    /// Verify and install a certificate issued for `request`
    pub async fn install(
        &self,
        request: &CertificateRequest,
        certificate_pem: String,
        ca_certificate_pem: String,
    ) -> AgentResult<()> {
        let common_name = verify_leaf(&certificate_pem, &ca_certificate_pem)?;
        if common_name != request.component_name() {
            return Err(AgentError::InvalidRequest(format!(
                "certificate issued for {common_name:?}, expected {:?}",
                request.component_name()
            )));
        }

        let key_pem = request.key_pem();
        let identity = TlsIdentity::new(certificate_pem, key_pem, ca_certificate_pem);
        let acceptor = TlsAcceptor::new(&identity)?;
        write_identity(&self.dir, &identity).await?;

        *self.acceptor.write().await = Some(acceptor);
        self.certificate
            .send_replace(Some(identity.certificate_pem.clone()));
        info!(component = %common_name, "Certificate installed, mutual TLS now required");
        Ok(())
    }
}

impl std::fmt::Debug for Enrollment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enrollment")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

async fn read_identity(dir: &Path) -> AgentResult<Option<TlsIdentity>> {
    let cert_path = dir.join(CERT_FILE);
    if !tokio::fs::try_exists(&cert_path).await.unwrap_or(false) {
        return Ok(None);
    }
    let certificate_pem = tokio::fs::read_to_string(&cert_path).await?;
    let key_pem = Zeroizing::new(tokio::fs::read_to_string(dir.join(KEY_FILE)).await?);
    let ca_certificate_pem = tokio::fs::read_to_string(dir.join(CA_FILE)).await?;
    Ok(Some(TlsIdentity::new(certificate_pem, key_pem, ca_certificate_pem)))
}

async fn write_identity(dir: &Path, identity: &TlsIdentity) -> AgentResult<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut key_file = create_private(&dir.join(KEY_FILE)).await?;
    key_file.write_all(identity.key_pem.as_bytes()).await?;
    key_file.sync_all().await?;
    tokio::fs::write(dir.join(CA_FILE), &identity.ca_certificate_pem).await?;
    // Written last: its presence marks a complete identity
    tokio::fs::write(dir.join(CERT_FILE), &identity.certificate_pem).await?;
    debug!(dir = %dir.display(), "Certificate saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxvault_core::SessionErrorKind;
    use fluxvault_crypto::CertificateAuthority;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_install_and_reload() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new("fluxvault-keeper-ca").unwrap();
        let enrollment = Enrollment::load(dir.path()).await.unwrap();
        let mut updates = enrollment.subscribe();
        assert!(!enrollment.is_enrolled().await);

        let request = CertificateRequest::generate("componentb").unwrap();
        let issued = ca.sign_request(request.csr_pem()).unwrap();
        enrollment
            .install(&request, issued.certificate_pem.clone(), ca.root_certificate_pem().to_string())
            .await
            .unwrap();

        assert!(enrollment.is_enrolled().await);
        assert!(updates.has_changed().unwrap());
        assert_eq!(
            updates.borrow_and_update().as_deref(),
            Some(issued.certificate_pem.as_str())
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join(KEY_FILE)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let reloaded = Enrollment::load(dir.path()).await.unwrap();
        assert!(reloaded.is_enrolled().await);
        assert!(reloaded.subscribe().borrow().is_some());
    }

    #[tokio::test]
    async fn test_certificate_from_other_root_rejected() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new("ca").unwrap();
        let other = CertificateAuthority::new("ca").unwrap();
        let enrollment = Enrollment::load(dir.path()).await.unwrap();

        let request = CertificateRequest::generate("componentb").unwrap();
        let issued = other.sign_request(request.csr_pem()).unwrap();
        let err = enrollment
            .install(&request, issued.certificate_pem, ca.root_certificate_pem().to_string())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), SessionErrorKind::InvalidRequest);
        assert!(!enrollment.is_enrolled().await);
        assert!(!dir.path().join(CERT_FILE).exists());
    }

    #[tokio::test]
    async fn test_certificate_for_other_component_rejected() {
        let dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::new("ca").unwrap();
        let enrollment = Enrollment::load(dir.path()).await.unwrap();

        let request = CertificateRequest::generate("componentb").unwrap();
        let other = CertificateRequest::generate("componentc").unwrap();
        let issued = ca.sign_request(other.csr_pem()).unwrap();
        assert!(enrollment
            .install(&request, issued.certificate_pem, ca.root_certificate_pem().to_string())
            .await
            .is_err());
    }
}
