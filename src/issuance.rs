//! Leaf certificate issuance for devices and the broker.
//!
//! Each issuance generates a new key pair, builds a CSR self-signed with that
//! key (proof of possession), and signs a leaf certificate against the
//! current root. All artifacts are built in memory first; files are only
//! touched once signing has succeeded.
//!
//! # X.509 Extensions
//! - **Basic Constraints**: `CA:false` (critical)
//! - **Key Usage**: `digitalSignature`, `keyEncipherment` (critical)
//! - **Subject Alternative Name**: device = `DNS:<name>`;
//!   broker = `DNS:localhost`, `IP:127.0.0.1`, `DNS:<name>`
//! - **Extended Key Usage**: `serverAuth`, broker only

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::stack::Stack;
use openssl::x509::{X509Req, X509};
use tracing::debug;

use crate::certificate::{self, san_extension, CertificateTemplate, DistinguishedName, SanEntry};
use crate::error::{PkiError, Result};
use crate::generate_root_ca::Authority;
use crate::keygen;
use crate::storage::{self, IdentityPaths};

const X509_REQ_VERSION_1: i32 = 0;

/// What a leaf identity is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// MQTT client: SAN is its own name only.
    Device,
    /// MQTT broker: reachable over loopback, asserts serverAuth.
    Broker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Device => write!(f, "device"),
            Role::Broker => write!(f, "broker"),
        }
    }
}

/// SAN set for `name` in `role`. Always contains `DNS:<name>`.
pub fn subject_alt_names(name: &str, role: Role) -> Vec<SanEntry> {
    match role {
        Role::Device => vec![SanEntry::Dns(name.to_string())],
        Role::Broker => vec![
            SanEntry::Dns("localhost".to_string()),
            SanEntry::Ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            SanEntry::Dns(name.to_string()),
        ],
    }
}

/// Subject and requested SAN carried by a CSR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    pub subject: DistinguishedName,
    pub san: Vec<SanEntry>,
}

impl SigningRequest {
    pub fn for_identity(name: &str, role: Role) -> Self {
        Self {
            subject: DistinguishedName::common_name(name),
            san: subject_alt_names(name, role),
        }
    }
}

/// Build a CSR over `request`, self-signed with `key`.
pub fn build_csr(request: &SigningRequest, key: &PKeyRef<Private>) -> Result<X509Req> {
    let mut builder =
        X509Req::builder().map_err(|e| PkiError::build("Failed to create CSR builder", e))?;
    builder
        .set_version(X509_REQ_VERSION_1)
        .map_err(|e| PkiError::build("Failed to set CSR version", e))?;
    let subject_name = request.subject.to_x509_name()?;
    builder
        .set_subject_name(&subject_name)
        .map_err(|e| PkiError::build("Failed to set CSR subject", e))?;
    builder
        .set_pubkey(key)
        .map_err(|e| PkiError::build("Failed to set CSR public key", e))?;

    let mut extensions =
        Stack::new().map_err(|e| PkiError::build("Failed to allocate extension stack", e))?;
    extensions
        .push(san_extension(&request.san, &builder.x509v3_context(None))?)
        .map_err(|e| PkiError::build("Failed to add SAN to CSR", e))?;
    builder
        .add_extensions(&extensions)
        .map_err(|e| PkiError::build("Failed to add CSR extensions", e))?;

    builder
        .sign(key, MessageDigest::sha256())
        .map_err(|e| PkiError::build("Failed to sign CSR", e))?;
    Ok(builder.build())
}

/// Key, CSR and signed certificate of one leaf, not yet on disk.
pub struct IssuedIdentity {
    pub name: String,
    pub role: Role,
    pub key: PKey<Private>,
    pub csr: X509Req,
    pub cert: X509,
}

impl fmt::Debug for IssuedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedIdentity")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("serial", &certificate::serial_hex(&self.cert).ok())
            .finish_non_exhaustive()
    }
}

/// Generate a key, CSR and leaf certificate for `name`, signed by `authority`.
///
/// # Errors
/// `KeyGeneration` for an unsupported `key_size`, `CertificateBuild` when the
/// CSR or certificate cannot be built or signed.
pub fn issue(
    name: &str,
    role: Role,
    authority: &Authority,
    validity_days: u32,
    key_size: u32,
) -> Result<IssuedIdentity> {
    let key = keygen::generate(key_size)?;
    let request = SigningRequest::for_identity(name, role);
    let csr = build_csr(&request, &key)?;

    let requested_key = csr
        .public_key()
        .map_err(|e| PkiError::build("Failed to read CSR public key", e))?;
    if !csr.verify(&requested_key).unwrap_or(false) {
        return Err(PkiError::CertificateBuild(format!(
            "CSR for '{}' failed proof-of-possession check",
            name
        )));
    }

    let mut template =
        CertificateTemplate::end_entity(request.subject.clone(), validity_days, request.san);
    template.server_auth = role == Role::Broker;

    let cert = certificate::sign(&template, &requested_key, authority.signer())?;
    debug!(identity = name, %role, "signed leaf certificate");

    Ok(IssuedIdentity {
        name: name.to_string(),
        role,
        key,
        csr,
        cert,
    })
}

/// Write an issued identity into its directory, then refresh its root copy.
///
/// The old certificate is removed before the new key lands, and the new
/// certificate is written last. A run interrupted in between leaves the
/// certificate missing, which the next run regenerates.
pub fn persist(paths: &IdentityPaths, issued: &IssuedIdentity, authority: &Authority) -> Result<()> {
    let key_pem = keygen::private_key_to_pem(&issued.key)?;
    let csr_pem = issued
        .csr
        .to_pem()
        .map_err(|e| PkiError::build("Failed to encode CSR", e))?;
    let cert_pem = issued
        .cert
        .to_pem()
        .map_err(|e| PkiError::build("Failed to encode certificate", e))?;

    storage::remove_file(&paths.cert)?;
    storage::write_private_key(&paths.key, &key_pem)?;
    storage::write_file(&paths.csr, &csr_pem)?;
    storage::write_file(&paths.cert, &cert_pem)?;
    distribute_authority(paths, authority)
}

/// Copy the current root certificate into an identity directory.
pub fn distribute_authority(paths: &IdentityPaths, authority: &Authority) -> Result<()> {
    storage::write_file(&paths.ca_cert, &authority.cert_pem()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::AppConfig;
    use crate::generate_root_ca::generate_authority;
    use crate::storage::CertStore;
    use tempfile::TempDir;

    fn authority() -> Authority {
        let config = AppConfig {
            root_key_size: 2048,
            ..AppConfig::default()
        };
        generate_authority(&config).unwrap()
    }

    #[test]
    fn test_san_sets() {
        assert_eq!(
            subject_alt_names("device001", Role::Device),
            vec![SanEntry::Dns("device001".into())]
        );
        assert_eq!(
            subject_alt_names("mosquitto", Role::Broker),
            vec![
                SanEntry::Dns("localhost".into()),
                SanEntry::Ip("127.0.0.1".parse().unwrap()),
                SanEntry::Dns("mosquitto".into()),
            ]
        );
    }

    #[test]
    fn test_csr_is_self_signed() {
        let key = keygen::generate(2048).unwrap();
        let request = SigningRequest::for_identity("device001", Role::Device);
        let csr = build_csr(&request, &key).unwrap();

        assert!(csr.verify(&key).unwrap());
        assert_eq!(
            certificate::format_name(csr.subject_name()),
            "CN=device001"
        );
        assert_eq!(
            csr.public_key().unwrap().public_key_to_der().unwrap(),
            key.public_key_to_der().unwrap()
        );
        assert_eq!(csr.extensions().unwrap().len(), 1);
    }

    #[test]
    fn test_device_certificate() {
        let authority = authority();
        let issued = issue("device001", Role::Device, &authority, 365, 2048).unwrap();

        assert!(issued.cert.verify(&authority.key).unwrap());
        assert_eq!(
            certificate::format_name(issued.cert.issuer_name()),
            certificate::format_name(authority.cert.subject_name())
        );
        assert!(!certificate::is_ca(&issued.cert));
        assert_eq!(
            certificate::subject_alt_names(&issued.cert),
            vec![SanEntry::Dns("device001".into())]
        );
        assert!(issued.key.public_eq(&issued.cert.public_key().unwrap()));
        let text = String::from_utf8_lossy(&issued.cert.to_text().unwrap()).to_string();
        assert!(!text.contains("TLS Web Server Authentication"));
    }

    #[test]
    fn test_broker_certificate_has_server_auth() {
        let authority = authority();
        let issued = issue("mosquitto", Role::Broker, &authority, 365, 2048).unwrap();

        assert!(issued.cert.verify(&authority.key).unwrap());
        assert_eq!(
            certificate::subject_alt_names(&issued.cert),
            subject_alt_names("mosquitto", Role::Broker)
        );
        let text = String::from_utf8_lossy(&issued.cert.to_text().unwrap()).to_string();
        assert!(text.contains("TLS Web Server Authentication"));
    }

    #[test]
    fn test_rejects_small_key_size() {
        let authority = authority();
        let err = issue("device001", Role::Device, &authority, 365, 1024).unwrap_err();
        assert!(matches!(err, PkiError::KeyGeneration(_)));
    }

    #[test]
    fn test_persist_writes_all_artifacts() {
        let dir = TempDir::new().unwrap();
        let store = CertStore::new(dir.path());
        let paths = store.identity_paths("device001");
        let authority = authority();

        let issued = issue("device001", Role::Device, &authority, 365, 2048).unwrap();
        persist(&paths, &issued, &authority).unwrap();

        let cert = X509::from_pem(&std::fs::read(&paths.cert).unwrap()).unwrap();
        assert_eq!(cert.to_der().unwrap(), issued.cert.to_der().unwrap());
        let key = keygen::private_key_from_pem(&std::fs::read(&paths.key).unwrap()).unwrap();
        assert!(key.public_eq(&cert.public_key().unwrap()));
        assert!(X509Req::from_pem(&std::fs::read(&paths.csr).unwrap()).is_ok());
        assert_eq!(
            std::fs::read(&paths.ca_cert).unwrap(),
            authority.cert_pem().unwrap()
        );
    }
}
