//! Root CA management.
//!
//! The fleet has exactly one authority: a self-signed RSA certificate with
//! `CA:true` that signs every device and broker certificate directly.
//!
//! ```text
//! Root CA (self-signed, pathlen=0) ← This module
//!   ├── device certificates
//!   └── broker certificate
//! ```
//!
//! [`ensure_root`] keeps an existing root when it is valid beyond the renewal
//! threshold and loads cleanly; otherwise it generates and persists a new one.
//! A new root invalidates every leaf signed by the previous one, so callers
//! must re-issue leaves afterwards (see `renewal`).

use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use tracing::{info, warn};

use crate::certificate::{self, CertificateTemplate, DistinguishedName, Signer};
use crate::configs::{AppConfig, RootCADefaults};
use crate::error::{PkiError, Result};
use crate::expiry::{self, CertStatus};
use crate::keygen;
use crate::storage::{self, CertStore, IdentityPaths};

/// The root key pair together with its self-signed certificate.
pub struct Authority {
    pub key: PKey<Private>,
    pub cert: X509,
}

impl std::fmt::Debug for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authority")
            .field("subject", &certificate::format_name(self.cert.subject_name()))
            .field("serial", &certificate::serial_hex(&self.cert).ok())
            .finish_non_exhaustive()
    }
}

impl Authority {
    pub fn signer(&self) -> Signer<'_> {
        Signer::Authority {
            key: &self.key,
            cert: &self.cert,
        }
    }

    pub fn cert_pem(&self) -> Result<Vec<u8>> {
        self.cert
            .to_pem()
            .map_err(|e| PkiError::build("Failed to encode root certificate", e))
    }
}

/// How [`ensure_root`] obtained the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootOutcome {
    /// Existing files reused unchanged.
    Loaded,
    /// A new root was generated; `previous` is what was found on disk.
    Generated { previous: CertStatus },
}

impl RootOutcome {
    pub fn rotated(&self) -> bool {
        matches!(self, RootOutcome::Generated { .. })
    }
}

impl std::fmt::Display for RootOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RootOutcome::Loaded => write!(f, "loaded existing root"),
            RootOutcome::Generated { previous } => {
                write!(f, "generated new root (previous {})", previous)
            }
        }
    }
}

/// Subject (and issuer) of the root certificate.
pub fn root_subject(defaults: &RootCADefaults) -> DistinguishedName {
    DistinguishedName::new()
        .with(Nid::COUNTRYNAME, &defaults.country)
        .with(Nid::ORGANIZATIONNAME, &defaults.organization)
        .with(Nid::COMMONNAME, &defaults.common_name)
}

/// Load the root when it is still valid, otherwise generate a new one.
pub fn ensure_root(store: &CertStore, config: &AppConfig) -> Result<(Authority, RootOutcome)> {
    let paths = store.authority_paths();
    let status = expiry::evaluate(&paths.cert, config.expiry_threshold_days);
    info!(path = %paths.cert.display(), %status, "checking root CA");

    if let CertStatus::Valid(remaining_days) = status {
        match load_authority(&paths) {
            Ok(authority) => {
                info!(remaining_days, "loaded existing root CA");
                return Ok((authority, RootOutcome::Loaded));
            }
            Err(e) => warn!(error = %e, "failed to load existing root CA, generating a new one"),
        }
    }

    let authority = generate_authority(config)?;
    persist_authority(&paths, &authority)?;
    info!(
        serial = %certificate::serial_hex(&authority.cert)?,
        validity_days = config.root_validity_days,
        "generated new root CA"
    );
    Ok((authority, RootOutcome::Generated { previous: status }))
}

/// Fresh key pair plus self-signed `CA:true` certificate. Nothing is written.
pub fn generate_authority(config: &AppConfig) -> Result<Authority> {
    let key = keygen::generate(config.root_key_size)?;
    let template = CertificateTemplate::self_signed_ca(
        root_subject(&config.root_ca),
        config.root_validity_days,
    );
    let cert = certificate::sign(&template, &key, Signer::SelfSigned(&key))?;
    Ok(Authority { key, cert })
}

/// Read and cross-check the persisted root key and certificate.
pub fn load_authority(paths: &IdentityPaths) -> Result<Authority> {
    let key_pem = storage::read_file(&paths.key)?
        .ok_or_else(|| PkiError::parse(&paths.key, "private key file is missing"))?;
    let key = keygen::private_key_from_pem(&key_pem).map_err(|e| PkiError::parse(&paths.key, e))?;

    let cert_pem = storage::read_file(&paths.cert)?
        .ok_or_else(|| PkiError::parse(&paths.cert, "certificate file is missing"))?;
    let cert = X509::from_pem(&cert_pem).map_err(|e| PkiError::parse(&paths.cert, e))?;

    let cert_key = cert
        .public_key()
        .map_err(|e| PkiError::parse(&paths.cert, e))?;
    if !key.public_eq(&cert_key) {
        return Err(PkiError::parse(
            &paths.key,
            "private key does not match the root certificate",
        ));
    }
    if !cert.verify(&cert_key).unwrap_or(false) || !certificate::is_ca(&cert) {
        return Err(PkiError::parse(
            &paths.cert,
            "root certificate is not a self-signed CA certificate",
        ));
    }

    Ok(Authority { key, cert })
}

// The old certificate goes first so an interrupted write reads as Missing.
fn persist_authority(paths: &IdentityPaths, authority: &Authority) -> Result<()> {
    storage::remove_file(&paths.cert)?;
    storage::write_private_key(&paths.key, &keygen::private_key_to_pem(&authority.key)?)?;
    storage::write_file(&paths.cert, &authority.cert_pem()?)?;
    Ok(())
}
