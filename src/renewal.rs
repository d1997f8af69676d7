//! One renewal pass over the configured fleet.
//!
//! The root is resolved once, under the store lock, before any leaf work; every
//! leaf in the pass is checked against and signed by that same authority. A
//! failure on one identity is recorded in the [`RunReport`] and the pass moves
//! on to the next identity.

use std::fmt;

use openssl::x509::{X509Ref, X509};
use tracing::{error, info, warn};

use crate::certificate::{self, format_name};
use crate::configs::AppConfig;
use crate::error::Result;
use crate::expiry::{self, CertStatus};
use crate::generate_root_ca::{self, Authority, RootOutcome};
use crate::issuance::{self, Role};
use crate::keygen;
use crate::storage::{self, CertStore, IdentityPaths};

/// Why a leaf was re-issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalReason {
    Missing,
    Unreadable,
    Expiring(u32),
    /// Time-valid, but not signed by the current root.
    RootRotated,
    /// Time-valid, but the private key is missing or belongs to another certificate.
    KeyMismatch,
}

impl fmt::Display for RenewalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenewalReason::Missing => write!(f, "certificate missing"),
            RenewalReason::Unreadable => write!(f, "certificate unreadable"),
            RenewalReason::Expiring(days) => write!(f, "expires in {} days", days),
            RenewalReason::RootRotated => write!(f, "not signed by current root"),
            RenewalReason::KeyMismatch => write!(f, "private key missing or mismatched"),
        }
    }
}

/// Result for a single identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityOutcome {
    /// New key, CSR and certificate written.
    Issued {
        reason: RenewalReason,
        serial: String,
    },
    /// Certificate kept; only the root copy was refreshed.
    Current { remaining_days: u32 },
    /// Nothing usable was written for this identity in this run.
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct IdentityReport {
    pub name: String,
    pub role: Role,
    pub outcome: IdentityOutcome,
}

/// Summary of one pass.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub root: RootOutcome,
    pub root_serial: String,
    pub identities: Vec<IdentityReport>,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &IdentityReport> {
        self.identities
            .iter()
            .filter(|r| matches!(r.outcome, IdentityOutcome::Failed { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn identity(&self, name: &str) -> Option<&IdentityReport> {
        self.identities.iter().find(|r| r.name == name)
    }
}

/// Configured identities with their roles: devices first, then the broker.
pub fn fleet(config: &AppConfig) -> Vec<(&str, Role)> {
    config
        .devices
        .iter()
        .map(|d| (d.as_str(), Role::Device))
        .chain(std::iter::once((config.broker.as_str(), Role::Broker)))
        .collect()
}

/// Run one renewal pass.
///
/// # Errors
/// Returns an error only when the configuration is invalid or the store lock
/// or root authority cannot be obtained. Per-identity failures are reported
/// in the returned [`RunReport`].
pub fn run(config: &AppConfig) -> Result<RunReport> {
    config.validate()?;
    let store = CertStore::new(&config.certs_dir);
    let _lock = store.lock()?;

    let (authority, root) = generate_root_ca::ensure_root(&store, config)?;
    let root_serial = certificate::serial_hex(&authority.cert)?;
    if root.rotated() {
        if config.reissue_on_root_rotation {
            info!("root CA rotated, leaves not signed by it will be re-issued");
        } else {
            warn!("root CA rotated, existing leaf certificates no longer chain to it");
        }
    }

    let identities = fleet(config)
        .into_iter()
        .map(|(name, role)| {
            let outcome = match process_identity(&store, config, &authority, name, role) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(identity = name, %role, error = %e, "identity processing failed");
                    IdentityOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            IdentityReport {
                name: name.to_string(),
                role,
                outcome,
            }
        })
        .collect();

    Ok(RunReport {
        root,
        root_serial,
        identities,
    })
}

fn process_identity(
    store: &CertStore,
    config: &AppConfig,
    authority: &Authority,
    name: &str,
    role: Role,
) -> Result<IdentityOutcome> {
    let paths = store.identity_paths(name);
    let status = expiry::evaluate(&paths.cert, config.expiry_threshold_days);
    info!(identity = name, %role, %status, "checking certificate");

    let reason = match status {
        CertStatus::Missing => RenewalReason::Missing,
        CertStatus::Unreadable => RenewalReason::Unreadable,
        CertStatus::Expiring(days) => RenewalReason::Expiring(days),
        CertStatus::Valid(remaining_days) => {
            let cert = read_leaf(&paths);
            if !cert.as_ref().is_some_and(|cert| key_matches(&paths, cert)) {
                RenewalReason::KeyMismatch
            } else if config.reissue_on_root_rotation
                && !cert.as_ref().is_some_and(|cert| chains_to(cert, authority))
            {
                RenewalReason::RootRotated
            } else {
                issuance::distribute_authority(&paths, authority)?;
                info!(identity = name, remaining_days, "certificate is current, root copy refreshed");
                return Ok(IdentityOutcome::Current { remaining_days });
            }
        }
    };

    let issued = issuance::issue(name, role, authority, config.validity_days, config.key_size)?;
    issuance::persist(&paths, &issued, authority)?;
    let serial = certificate::serial_hex(&issued.cert)?;
    info!(identity = name, %role, %reason, %serial, "issued new certificate");
    Ok(IdentityOutcome::Issued { reason, serial })
}

fn read_leaf(paths: &IdentityPaths) -> Option<X509> {
    match storage::read_file(&paths.cert) {
        Ok(Some(pem)) => X509::from_pem(&pem).ok(),
        _ => None,
    }
}

/// Whether the identity's private key exists, parses and belongs to `cert`.
fn key_matches(paths: &IdentityPaths, cert: &X509Ref) -> bool {
    let key = match storage::read_file(&paths.key) {
        Ok(Some(pem)) => keygen::private_key_from_pem(&pem).ok(),
        _ => None,
    };
    match (key, cert.public_key()) {
        (Some(key), Ok(public)) => key.public_eq(&public),
        _ => false,
    }
}

/// Whether `cert` names the authority as issuer and verifies under its key.
fn chains_to(cert: &X509Ref, authority: &Authority) -> bool {
    format_name(cert.issuer_name()) == format_name(authority.cert.subject_name())
        && cert.verify(&authority.key).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> AppConfig {
        AppConfig {
            certs_dir: dir.path().join("certs"),
            devices: vec!["dev1".to_string()],
            broker: "broker".to_string(),
            root_key_size: 2048,
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_fleet_order_and_roles() {
        let config = AppConfig::default();
        assert_eq!(
            fleet(&config),
            vec![
                ("device001", Role::Device),
                ("device002", Role::Device),
                ("mosquitto", Role::Broker),
            ]
        );
    }

    #[test]
    fn test_invalid_config_is_rejected_before_any_write() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.key_size = 512;
        assert!(run(&config).is_err());
        assert!(!config.certs_dir.exists());
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let first = run(&config).unwrap();
        assert!(first.is_success());
        assert!(first.root.rotated());
        for report in &first.identities {
            assert!(matches!(
                report.outcome,
                IdentityOutcome::Issued {
                    reason: RenewalReason::Missing,
                    ..
                }
            ));
        }

        let second = run(&config).unwrap();
        assert_eq!(second.root, RootOutcome::Loaded);
        assert_eq!(second.root_serial, first.root_serial);
        for report in &second.identities {
            assert!(matches!(report.outcome, IdentityOutcome::Current { .. }));
        }
    }

    #[test]
    fn test_failure_is_isolated_to_one_identity() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let store = CertStore::new(&config.certs_dir);

        // A directory where the certificate file should be makes every write for dev1 fail.
        std::fs::create_dir_all(store.identity_paths("dev1").cert.join("blocker")).unwrap();

        let report = run(&config).unwrap();
        assert!(!report.is_success());
        assert!(matches!(
            report.identity("dev1").unwrap().outcome,
            IdentityOutcome::Failed { .. }
        ));
        assert!(matches!(
            report.identity("broker").unwrap().outcome,
            IdentityOutcome::Issued { .. }
        ));
        assert_eq!(report.failures().count(), 1);
    }
}
