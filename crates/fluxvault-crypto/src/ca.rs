//! Embedded certificate authority for proxied hops
//!
//! The keeper creates one [`CertificateAuthority`] at startup. Sub-agents
//! generate their key pair locally ([`CertificateRequest`]), the CSR is relayed
//! to the keeper, and the keeper signs it. The private key of a sub-agent never
//! leaves the sub-agent. The root lives only in memory: restarting the keeper
//! mints a new root and every previously issued leaf stops validating.

use std::sync::Mutex;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use tracing::{debug, info, warn};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::{FromDer, X509Certificate};
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};

/// Validity of the in-memory root
pub const ROOT_VALIDITY_DAYS: i64 = 365;

/// Validity of issued leaf certificates
pub const LEAF_VALIDITY_DAYS: i64 = 30;

const ORGANIZATION: &str = "FluxVault";

const CSR_PEM_TAG: &str = "CERTIFICATE REQUEST";
const CERT_PEM_TAG: &str = "CERTIFICATE";

fn validity(days: i64) -> (time::OffsetDateTime, time::OffsetDateTime) {
    let now = time::OffsetDateTime::now_utc();
    // Backdate slightly so peers with skewed clocks accept fresh certificates
    (now - time::Duration::minutes(5), now + time::Duration::days(days))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(DnType::OrganizationName, DnValue::Utf8String(ORGANIZATION.to_string()));
    dn
}

/// Component names become DNS SANs, so they must be valid DNS labels
fn validate_common_name(common_name: &str) -> CryptoResult<()> {
    let valid = !common_name.is_empty()
        && common_name.len() <= 253
        && common_name
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            });
    if valid {
        Ok(())
    } else {
        Err(CryptoError::InvalidRequest(format!(
            "common name is not a valid DNS name: {common_name:?}"
        )))
    }
}

fn parse_pem_block(data: &str, expected_tag: &str) -> CryptoResult<Vec<u8>> {
    let block = ::pem::parse(data).map_err(|e| {
        CryptoError::InvalidRequest(format!("failed to parse PEM: {e}"))
    })?;
    if block.tag() != expected_tag {
        return Err(CryptoError::InvalidRequest(format!(
            "expected PEM block {expected_tag}, found {}",
            block.tag()
        )));
    }
    Ok(block.into_contents())
}

/// One certificate issued by the authority
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub serial: u64,
    pub common_name: String,
    pub certificate_pem: String,
}

/// A certificate together with its private key
#[derive(Clone)]
pub struct LeafIdentity {
    pub certificate_pem: String,
    pub key_pem: Zeroizing<String>,
}

impl std::fmt::Debug for LeafIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafIdentity")
            .field("certificate_pem", &self.certificate_pem)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Ledger {
    next_serial: u64,
    issued: Vec<(u64, String)>,
}

/// The keeper's root key, root certificate and issuance ledger
///
/// Constructed explicitly and passed by handle; issuance is serialized by an
/// internal lock so concurrent sessions may share one authority.
pub struct CertificateAuthority {
    root_key_pem: Zeroizing<String>,
    root_cert_pem: String,
    ledger: Mutex<Ledger>,
}

impl CertificateAuthority {
    /// Create a fresh self-signed root
    pub fn new(common_name: &str) -> CryptoResult<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = validity(ROOT_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            CryptoError::CertificateGeneration(format!("failed to generate root key: {e}"))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            CryptoError::CertificateGeneration(format!("failed to create root certificate: {e}"))
        })?;

        info!(common_name, "Created certificate authority root");

        Ok(Self {
            root_key_pem: Zeroizing::new(key_pair.serialize_pem()),
            root_cert_pem: cert.pem(),
            ledger: Mutex::new(Ledger {
                next_serial: 1,
                issued: Vec::new(),
            }),
        })
    }

    /// Root certificate, distributed to every agent that should trust it
    pub fn root_certificate_pem(&self) -> &str {
        &self.root_cert_pem
    }

    /// Serials and common names issued so far
    pub fn issued(&self) -> Vec<(u64, String)> {
        self.ledger
            .lock()
            .map(|ledger| ledger.issued.clone())
            .unwrap_or_default()
    }

    fn load_issuer(&self) -> CryptoResult<Issuer<'static, KeyPair>> {
        let key = KeyPair::from_pem(&self.root_key_pem).map_err(|e| {
            CryptoError::CertificateGeneration(format!("failed to load root key: {e}"))
        })?;
        Issuer::from_ca_cert_pem(&self.root_cert_pem, key).map_err(|e| {
            CryptoError::CertificateGeneration(format!("failed to create issuer: {e}"))
        })
    }

    fn leaf_params(params: &mut CertificateParams, common_name: &str, serial: u64) -> CryptoResult<()> {
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        let san = Ia5String::try_from(common_name.to_string()).map_err(|e| {
            CryptoError::InvalidRequest(format!("invalid DNS name {common_name:?}: {e}"))
        })?;
        params.subject_alt_names = vec![SanType::DnsName(san)];
        params.serial_number = Some(SerialNumber::from(serial));
        let (not_before, not_after) = validity(LEAF_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;
        Ok(())
    }

    /// Sign a PEM-encoded certificate signing request
    ///
    /// The CSR must parse, carry a valid self-signature and name a common
    /// name usable as a DNS name. The issued leaf keeps only the CSR's public
    /// key and common name; every other attribute is set by the authority.
    pub fn sign_request(&self, csr_pem: &str) -> CryptoResult<IssuedCertificate> {
        let der = parse_pem_block(csr_pem, CSR_PEM_TAG)?;
        let (_, csr) = X509CertificationRequest::from_der(&der)
            .map_err(|e| CryptoError::InvalidRequest(format!("failed to parse CSR: {e}")))?;
        csr.verify_signature().map_err(|e| {
            CryptoError::InvalidRequest(format!("CSR self-signature invalid: {e}"))
        })?;

        let common_name = csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .ok_or_else(|| CryptoError::InvalidRequest("CSR has no common name".to_string()))?;
        validate_common_name(&common_name)?;

        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| CryptoError::InvalidRequest(format!("failed to parse CSR: {e}")))?;

        let mut ledger = self
            .ledger
            .lock()
            .map_err(|_| CryptoError::CertificateGeneration("ledger lock poisoned".to_string()))?;
        let serial = ledger.next_serial;

        Self::leaf_params(&mut csr_params.params, &common_name, serial)?;
        let issuer = self.load_issuer()?;
        let cert = csr_params.signed_by(&issuer).map_err(|e| {
            CryptoError::CertificateGeneration(format!("failed to sign certificate: {e}"))
        })?;

        ledger.next_serial += 1;
        ledger.issued.push((serial, common_name.clone()));
        drop(ledger);

        info!(serial, common_name = %common_name, "Issued leaf certificate");

        Ok(IssuedCertificate {
            serial,
            common_name,
            certificate_pem: cert.pem(),
        })
    }

    /// Issue a leaf for a locally generated key, used for the keeper's own
    /// client identity on proxied hops
    pub fn issue_identity(&self, common_name: &str) -> CryptoResult<LeafIdentity> {
        validate_common_name(common_name)?;
        let key_pair = KeyPair::generate().map_err(|e| {
            CryptoError::CertificateGeneration(format!("failed to generate leaf key: {e}"))
        })?;

        let mut ledger = self
            .ledger
            .lock()
            .map_err(|_| CryptoError::CertificateGeneration("ledger lock poisoned".to_string()))?;
        let serial = ledger.next_serial;

        let mut params = CertificateParams::default();
        Self::leaf_params(&mut params, common_name, serial)?;
        let issuer = self.load_issuer()?;
        let cert = params.signed_by(&key_pair, &issuer).map_err(|e| {
            CryptoError::CertificateGeneration(format!("failed to sign certificate: {e}"))
        })?;

        ledger.next_serial += 1;
        ledger.issued.push((serial, common_name.to_string()));
        drop(ledger);

        debug!(serial, common_name, "Issued local identity");

        Ok(LeafIdentity {
            certificate_pem: cert.pem(),
            key_pem: Zeroizing::new(key_pair.serialize_pem()),
        })
    }

    /// Check that `certificate_pem` was issued by this root and is in date
    pub fn verify_certificate(&self, certificate_pem: &str) -> CryptoResult<String> {
        verify_leaf(certificate_pem, &self.root_cert_pem)
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("issued", &self.issued().len())
            .finish_non_exhaustive()
    }
}

/// Verify a PEM leaf against a PEM root, returning the leaf's common name
pub fn verify_leaf(certificate_pem: &str, root_pem: &str) -> CryptoResult<String> {
    let leaf_der = parse_pem_block(certificate_pem, CERT_PEM_TAG)
        .map_err(|e| CryptoError::CertificateRejected(e.to_string()))?;
    let root_der = parse_pem_block(root_pem, CERT_PEM_TAG)
        .map_err(|e| CryptoError::CertificateRejected(e.to_string()))?;

    let (_, leaf) = X509Certificate::from_der(&leaf_der)
        .map_err(|e| CryptoError::CertificateRejected(format!("failed to parse certificate: {e}")))?;
    let (_, root) = X509Certificate::from_der(&root_der)
        .map_err(|e| CryptoError::CertificateRejected(format!("failed to parse root: {e}")))?;

    if leaf.issuer() != root.subject() {
        warn!("Certificate issuer does not match root subject");
        return Err(CryptoError::CertificateRejected(
            "issuer does not match root".to_string(),
        ));
    }
    leaf.verify_signature(Some(root.public_key())).map_err(|_| {
        warn!("Certificate signature does not verify against root");
        CryptoError::CertificateRejected("signature verification failed".to_string())
    })?;
    if !leaf.validity().is_valid() {
        return Err(CryptoError::CertificateRejected(
            "certificate outside its validity period".to_string(),
        ));
    }

    leaf.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| CryptoError::CertificateRejected("certificate has no common name".to_string()))
}

/// Key pair and CSR generated on a sub-agent
///
/// The private key stays on the sub-agent; only [`Self::csr_pem`] is sent.
pub struct CertificateRequest {
    component_name: String,
    csr_pem: String,
    key_pem: Zeroizing<String>,
}

impl CertificateRequest {
    /// Generate a key pair and CSR for `component_name`
    pub fn generate(component_name: &str) -> CryptoResult<Self> {
        validate_common_name(component_name)?;
        let key_pair = KeyPair::generate().map_err(|e| {
            CryptoError::CertificateGeneration(format!("failed to generate key: {e}"))
        })?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(component_name);

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            CryptoError::CertificateGeneration(format!("failed to create CSR: {e}"))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            CryptoError::CertificateGeneration(format!("failed to serialize CSR: {e}"))
        })?;

        Ok(Self {
            component_name: component_name.to_string(),
            csr_pem,
            key_pem: Zeroizing::new(key_pair.serialize_pem()),
        })
    }

    pub fn component_name(&self) -> &str {
        &self.component_name
    }

    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Copy of the private key, for installing alongside the issued certificate
    pub fn key_pem(&self) -> Zeroizing<String> {
        self.key_pem.clone()
    }

    /// Pair the private key with the certificate issued for this request
    pub fn into_identity(self, certificate_pem: String) -> LeafIdentity {
        LeafIdentity {
            certificate_pem,
            key_pem: self.key_pem,
        }
    }
}

impl std::fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("component_name", &self.component_name)
            .finish_non_exhaustive()
    }
}
