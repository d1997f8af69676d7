//! Read-only certificate metadata, in the shape monitoring tools consume.

use std::path::{Path, PathBuf};

use openssl::x509::X509;
use serde::Serialize;

use crate::certificate::{self, format_name};
use crate::configs::AppConfig;
use crate::error::{PkiError, Result};
use crate::expiry;
use crate::storage::{self, CertStore, ROOT_CA_DIR_NAME};

/// Metadata of one parsed certificate.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CertificateInfo {
    pub identity: String,
    pub path: PathBuf,
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: String,
    pub not_after: String,
    pub remaining_days: u32,
    pub is_ca: bool,
    pub san: Vec<String>,
}

/// Metadata, or why it could not be produced.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum InspectEntry {
    Ok(CertificateInfo),
    Error {
        identity: String,
        path: PathBuf,
        error: String,
    },
}

pub fn read_certificate_info(identity: &str, path: &Path) -> Result<CertificateInfo> {
    let pem = storage::read_file(path)?
        .ok_or_else(|| PkiError::parse(path, "Certificate not found"))?;
    let cert = X509::from_pem(&pem).map_err(|e| PkiError::parse(path, e))?;

    Ok(CertificateInfo {
        identity: identity.to_string(),
        path: path.to_path_buf(),
        subject: format_name(cert.subject_name()),
        issuer: format_name(cert.issuer_name()),
        serial: certificate::serial_hex(&cert)?,
        not_before: cert.not_before().to_string(),
        not_after: cert.not_after().to_string(),
        remaining_days: expiry::remaining_days(&cert)?,
        is_ca: certificate::is_ca(&cert),
        san: certificate::subject_alt_names(&cert)
            .iter()
            .map(ToString::to_string)
            .collect(),
    })
}

fn entry(identity: &str, path: PathBuf) -> InspectEntry {
    match read_certificate_info(identity, &path) {
        Ok(info) => InspectEntry::Ok(info),
        Err(e) => InspectEntry::Error {
            identity: identity.to_string(),
            path,
            error: e.to_string(),
        },
    }
}

pub fn inspect_identity(store: &CertStore, name: &str) -> InspectEntry {
    entry(name, store.identity_paths(name).cert)
}

/// Root first, then every device, then the broker.
pub fn inspect_all(store: &CertStore, config: &AppConfig) -> Vec<InspectEntry> {
    std::iter::once(entry(ROOT_CA_DIR_NAME, store.authority_paths().cert))
        .chain(config.identity_names().map(|name| inspect_identity(store, name)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renewal;
    use tempfile::TempDir;

    #[test]
    fn test_reports_missing_and_issued() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig {
            certs_dir: dir.path().to_path_buf(),
            devices: vec!["dev1".to_string()],
            broker: "broker".to_string(),
            root_key_size: 2048,
            ..AppConfig::default()
        };
        let store = CertStore::new(&config.certs_dir);

        match inspect_identity(&store, "dev1") {
            InspectEntry::Error { error, .. } => assert!(error.contains("Certificate not found")),
            other => panic!("expected error entry, got {:?}", other),
        }

        renewal::run(&config).unwrap();
        let entries = inspect_all(&store, &config);
        assert_eq!(entries.len(), 3);

        let InspectEntry::Ok(root) = &entries[0] else {
            panic!("root should be readable");
        };
        assert!(root.is_ca);
        assert_eq!(root.subject, root.issuer);

        let InspectEntry::Ok(broker) = &entries[2] else {
            panic!("broker should be readable");
        };
        assert_eq!(broker.subject, "CN=broker");
        assert_eq!(broker.issuer, root.subject);
        assert_eq!(broker.san, vec!["DNS:localhost", "IP:127.0.0.1", "DNS:broker"]);
        assert!(!broker.is_ca);
        assert!((364..=365).contains(&broker.remaining_days));

        let json = serde_json::to_value(&entries[1]).unwrap();
        assert_eq!(json["identity"], "dev1");
        assert!(json["serial"].is_string());
    }
}
