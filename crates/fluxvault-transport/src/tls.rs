//! Mutual TLS for proxied hops
//!
//! Both ends present a certificate issued by the keeper's authority and trust
//! only that authority's root. TLS runs underneath the session handshake, so a
//! proxied session is protected twice.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client, server};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{TransportError, TransportResult};

/// A certificate, its private key and the root it chains to
#[derive(Clone)]
pub struct TlsIdentity {
    pub certificate_pem: String,
    pub key_pem: Zeroizing<String>,
    pub ca_certificate_pem: String,
}

impl TlsIdentity {
    pub fn new(
        certificate_pem: impl Into<String>,
        key_pem: Zeroizing<String>,
        ca_certificate_pem: impl Into<String>,
    ) -> Self {
        Self {
            certificate_pem: certificate_pem.into(),
            key_pem,
            ca_certificate_pem: ca_certificate_pem.into(),
        }
    }

    fn certificates(&self) -> TransportResult<Vec<CertificateDer<'static>>> {
        load_certs(&self.certificate_pem)
    }

    fn private_key(&self) -> TransportResult<PrivateKeyDer<'static>> {
        rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
            .map_err(|e| TransportError::Tls(format!("failed to parse private key: {e}")))?
            .ok_or_else(|| TransportError::Tls("no private key in PEM".to_string()))
    }

    fn root_store(&self) -> TransportResult<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&self.ca_certificate_pem)? {
            roots
                .add(cert)
                .map_err(|e| TransportError::Tls(format!("invalid root certificate: {e}")))?;
        }
        Ok(roots)
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity").finish_non_exhaustive()
    }
}

fn load_certs(pem: &str) -> TransportResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("failed to parse certificate: {e}")))?;
    if certs.is_empty() {
        return Err(TransportError::Tls("no certificate in PEM".to_string()));
    }
    Ok(certs)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client side of a proxied hop: the keeper
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn new(identity: &TlsIdentity) -> TransportResult<Self> {
        let config = ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_root_certificates(identity.root_store()?)
            .with_client_auth_cert(identity.certificates()?, identity.private_key()?)
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }

    /// Run the TLS handshake, expecting a certificate for `server_name`
    pub async fn connect<S>(
        &self,
        server_name: &str,
        stream: S,
    ) -> TransportResult<client::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TransportError::Tls(format!("invalid server name {server_name:?}: {e}")))?;
        let stream = self
            .inner
            .connect(name, stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        debug!(server_name, "TLS client handshake complete");
        Ok(stream)
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector").finish_non_exhaustive()
    }
}

/// Server side of a proxied hop: an enrolled sub-agent
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Require client certificates issued by the identity's root
    pub fn new(identity: &TlsIdentity) -> TransportResult<Self> {
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(identity.root_store()?), provider())
                .build()
                .map_err(|e| TransportError::Tls(e.to_string()))?;

        let config = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(identity.certificates()?, identity.private_key()?)
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(config)),
        })
    }

    pub async fn accept<S>(&self, stream: S) -> TransportResult<server::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = self
            .inner
            .accept(stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        debug!("TLS server handshake complete");
        Ok(stream)
    }
}

impl std::fmt::Debug for TlsAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsAcceptor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxvault_crypto::{CertificateAuthority, CertificateRequest};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn sub_agent_identity(ca: &CertificateAuthority, name: &str) -> TlsIdentity {
        let request = CertificateRequest::generate(name).unwrap();
        let issued = ca.sign_request(request.csr_pem()).unwrap();
        let leaf = request.into_identity(issued.certificate_pem);
        TlsIdentity::new(leaf.certificate_pem, leaf.key_pem, ca.root_certificate_pem())
    }

    fn keeper_identity(ca: &CertificateAuthority) -> TlsIdentity {
        let leaf = ca.issue_identity("keeper.fluxvault.local").unwrap();
        TlsIdentity::new(leaf.certificate_pem, leaf.key_pem, ca.root_certificate_pem())
    }

    #[tokio::test]
    async fn test_mutual_tls_with_shared_root() {
        let ca = CertificateAuthority::new("ca").unwrap();
        let acceptor = TlsAcceptor::new(&sub_agent_identity(&ca, "componentb")).unwrap();
        let connector = TlsConnector::new(&keeper_identity(&ca)).unwrap();

        let (a, b) = duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let mut stream = acceptor.accept(a).await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
        });

        let mut stream = connector.connect("componentb", b).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_from_other_root_rejected() {
        let ca = CertificateAuthority::new("ca").unwrap();
        let stale = CertificateAuthority::new("ca").unwrap();
        let acceptor = TlsAcceptor::new(&sub_agent_identity(&ca, "componentb")).unwrap();

        // Client trusts the right root but presents a certificate from another
        let stale_leaf = stale.issue_identity("keeper.fluxvault.local").unwrap();
        let mixed = TlsIdentity::new(
            stale_leaf.certificate_pem,
            stale_leaf.key_pem,
            ca.root_certificate_pem(),
        );
        let connector = TlsConnector::new(&mixed).unwrap();

        let (a, b) = duplex(64 * 1024);
        let server = tokio::spawn(async move { acceptor.accept(a).await.map(|_| ()) });

        // Under TLS 1.3 the client may finish its half before the server
        // rejects the certificate, so only the server outcome is checked
        let client = async {
            let mut stream = connector.connect("componentb", b).await?;
            let mut buf = [0u8; 1];
            stream.read(&mut buf).await?;
            Ok::<_, TransportError>(())
        };
        let _ = client.await;
        assert!(server.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_wrong_server_name_rejected() {
        let ca = CertificateAuthority::new("ca").unwrap();
        let acceptor = TlsAcceptor::new(&sub_agent_identity(&ca, "componentb")).unwrap();
        let connector = TlsConnector::new(&keeper_identity(&ca)).unwrap();

        let (a, b) = duplex(64 * 1024);
        let server = tokio::spawn(async move { acceptor.accept(a).await.map(|_| ()) });

        assert!(connector.connect("componentc", b).await.is_err());
        let _ = server.await;
    }

    #[test]
    fn test_identity_without_key_rejected() {
        let identity = TlsIdentity::new("", Zeroizing::new(String::new()), "");
        assert!(TlsConnector::new(&identity).is_err());
    }
}
