//! Expiry policy: decides whether a certificate on disk must be regenerated.
//!
//! Read failures never block renewal. A missing file and an unparsable file
//! are both reported explicitly and both require a fresh certificate.

use std::fmt;
use std::path::Path;

use openssl::asn1::Asn1Time;
use openssl::x509::{X509Ref, X509};
use tracing::{debug, warn};

use crate::error::{PkiError, Result};
use crate::storage;

/// State of one certificate file relative to the renewal threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    /// No file at the path.
    Missing,
    /// File exists but is not a PEM X.509 certificate.
    Unreadable,
    /// More than the threshold remains (whole days).
    Valid(u32),
    /// At most the threshold remains (whole days, never negative).
    Expiring(u32),
}

impl CertStatus {
    /// Everything but `Valid` requires a new key and certificate.
    pub fn needs_renewal(&self) -> bool {
        !matches!(self, CertStatus::Valid(_))
    }

    pub fn remaining_days(&self) -> Option<u32> {
        match self {
            CertStatus::Valid(days) | CertStatus::Expiring(days) => Some(*days),
            CertStatus::Missing | CertStatus::Unreadable => None,
        }
    }
}

impl fmt::Display for CertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertStatus::Missing => write!(f, "missing"),
            CertStatus::Unreadable => write!(f, "unreadable"),
            CertStatus::Valid(days) => write!(f, "valid ({} days remaining)", days),
            CertStatus::Expiring(days) => write!(f, "expiring ({} days remaining)", days),
        }
    }
}

/// Classify the certificate at `path`. Performs no writes.
pub fn evaluate(path: &Path, threshold_days: u32) -> CertStatus {
    let pem = match storage::read_file(path) {
        Ok(Some(pem)) => pem,
        Ok(None) => {
            debug!(path = %path.display(), "certificate not found");
            return CertStatus::Missing;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "certificate could not be read");
            return CertStatus::Unreadable;
        }
    };

    let status = X509::from_pem(&pem)
        .map_err(|e| PkiError::parse(path, e))
        .and_then(|cert| classify(&cert, threshold_days));

    match status {
        Ok(status) => {
            debug!(path = %path.display(), %status, "certificate evaluated");
            status
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "certificate is unreadable");
            CertStatus::Unreadable
        }
    }
}

/// Classify an already parsed certificate against `threshold_days`.
pub fn classify(cert: &X509Ref, threshold_days: u32) -> Result<CertStatus> {
    let remaining = remaining_days(cert)?;
    if remaining <= threshold_days {
        Ok(CertStatus::Expiring(remaining))
    } else {
        Ok(CertStatus::Valid(remaining))
    }
}

/// Whole days from now until `notAfter`, rounded down and clamped at zero.
pub fn remaining_days(cert: &X509Ref) -> Result<u32> {
    let now =
        Asn1Time::days_from_now(0).map_err(|e| PkiError::build("Failed to read current time", e))?;
    let diff = now
        .diff(cert.not_after())
        .map_err(|e| PkiError::build("Failed to compare validity window", e))?;

    if diff.days < 0 || (diff.days == 0 && diff.secs < 0) {
        return Ok(0);
    }
    Ok(diff.days as u32)
}
