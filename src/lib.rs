//! Fleet PKI - root CA and certificate renewal for a private device fleet
//!
//! Provisions and maintains TLS identities for a small MQTT deployment: one
//! self-signed root authority, and leaf identities for devices and a broker,
//! each re-issued before it expires.
//!
//! # Overview
//!
//! ```text
//! Root CA (self-signed, CA:true, pathlen=0)
//!   ├── device001   (CA:false, SAN=DNS:device001)
//!   ├── device002   (CA:false, SAN=DNS:device002)
//!   └── mosquitto   (CA:false, SAN=DNS:localhost,IP:127.0.0.1,DNS:mosquitto, EKU=serverAuth)
//! ```
//!
//! A run is a single synchronous pass: resolve the root, then for each
//! identity decide from its certificate's remaining validity whether to
//! re-issue it. Identities whose certificate is still valid only get a fresh
//! copy of the root certificate.
//!
//! # Output Layout
//!
//! ```text
//! certs/root_ca/root_ca.key
//! certs/root_ca/root_ca.crt
//! certs/<identity>/<identity>.key
//! certs/<identity>/<identity>.crt
//! certs/<identity>/<identity>.csr
//! certs/<identity>/root_ca.crt
//! ```
//!
//! # Example
//!
//! ```no_run
//! use fleet_pki::configs::AppConfig;
//! use fleet_pki::renewal;
//!
//! let config = AppConfig::default();
//! let report = renewal::run(&config)?;
//! for identity in &report.identities {
//!     println!("{}: {:?}", identity.name, identity.outcome);
//! }
//! # Ok::<(), fleet_pki::error::PkiError>(())
//! ```
//!
//! # Module Overview
//!
//! - [`keygen`]: RSA key generation and PEM encoding
//! - [`expiry`]: `Missing | Unreadable | Valid(n) | Expiring(n)` classification
//! - [`certificate`]: certificate descriptors and signing
//! - [`generate_root_ca`]: root authority load-or-generate
//! - [`issuance`]: CSR and leaf certificate issuance
//! - [`storage`]: directory layout, atomic writes, store lock
//! - [`renewal`]: the batch pass and its report
//! - [`inspect`]: certificate metadata for monitoring

pub mod certificate;
pub mod configs;
pub mod error;
pub mod expiry;
pub mod generate_root_ca;
pub mod inspect;
pub mod issuance;
pub mod keygen;
pub mod renewal;
pub mod storage;

pub use error::{PkiError, Result};
