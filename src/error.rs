//! Error taxonomy for key generation, certificate handling and persistence.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, PkiError>;

/// Errors produced while provisioning or renewing an identity.
#[derive(Error, Debug)]
pub enum PkiError {
    /// Unsupported key size or failure of the RSA generator.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// A key, certificate or CSR on disk could not be decoded.
    #[error("failed to parse {path}: {message}")]
    CertificateParse {
        /// File that failed to parse
        path: PathBuf,
        /// Decoder message
        message: String,
    },

    /// Building or signing a certificate or CSR failed.
    #[error("certificate build failed: {0}")]
    CertificateBuild(String),

    /// Filesystem failure while reading or writing artifacts.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PkiError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PkiError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        PkiError::CertificateParse {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn build(context: &str, err: impl std::fmt::Display) -> Self {
        PkiError::CertificateBuild(format!("{}: {}", context, err))
    }
}
