//! Certificate descriptors and signing.
//!
//! A [`CertificateTemplate`] is a plain value describing everything a
//! certificate should contain apart from its key material. [`sign`] turns it
//! into a finished X.509v3 certificate in one call; no partially built
//! OpenSSL builder leaves this module.

use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, PKeyRef, Private};
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509Name, X509NameRef, X509Ref, X509v3Context, X509};
use openssl::x509::X509Extension;

use crate::error::{PkiError, Result};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const SERIAL_NUMBER_BITS: i32 = 128;
const SECONDS_PER_DAY: i64 = 86_400;

/// Ordered list of distinguished-name attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinguishedName {
    entries: Vec<(Nid, String)>,
}

impl DistinguishedName {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// `CN=<cn>` and nothing else, as used for leaf identities.
    pub fn common_name(cn: &str) -> Self {
        Self::new().with(Nid::COMMONNAME, cn)
    }

    pub fn with(mut self, nid: Nid, value: &str) -> Self {
        self.entries.push((nid, value.to_string()));
        self
    }

    pub fn to_x509_name(&self) -> Result<X509Name> {
        let mut name_builder = X509Name::builder()
            .map_err(|e| PkiError::build("Failed to create name builder", e))?;
        for (nid, value) in &self.entries {
            name_builder
                .append_entry_by_nid(*nid, value)
                .map_err(|e| PkiError::build(&format!("Failed to set {}", nid_label(*nid)), e))?;
        }
        Ok(name_builder.build())
    }
}

impl Default for DistinguishedName {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|(nid, value)| format!("{}={}", nid_label(*nid), value))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

fn nid_label(nid: Nid) -> &'static str {
    nid.short_name().unwrap_or("?")
}

/// Render an X.509 name as `C=..,O=..,CN=..` in encoding order.
pub fn format_name(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let label = nid_label(entry.object().nid());
            let value = entry
                .data()
                .to_string()
                .unwrap_or_else(|_| String::from_utf8_lossy(entry.data().as_slice()).into_owned());
            format!("{}={}", label, value)
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// One subjectAltName entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SanEntry {
    Dns(String),
    Ip(IpAddr),
}

impl fmt::Display for SanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SanEntry::Dns(name) => write!(f, "DNS:{}", name),
            SanEntry::Ip(ip) => write!(f, "IP:{}", ip),
        }
    }
}

/// Build a subjectAltName extension in the given context.
pub(crate) fn san_extension(san: &[SanEntry], ctx: &X509v3Context<'_>) -> Result<X509Extension> {
    let mut ext = SubjectAlternativeName::new();
    for entry in san {
        match entry {
            SanEntry::Dns(name) => ext.dns(name),
            SanEntry::Ip(ip) => ext.ip(&ip.to_string()),
        };
    }
    ext.build(ctx)
        .map_err(|e| PkiError::build("Failed to build SubjectAlternativeName", e))
}

/// Validity window as seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: i64,
    pub not_after: i64,
}

impl Validity {
    /// `[now, now + days]`.
    pub fn days_from_now(days: u32) -> Self {
        let now = unix_now();
        Self {
            not_before: now,
            not_after: now + i64::from(days) * SECONDS_PER_DAY,
        }
    }

    /// Shift both ends by whole days (negative moves into the past).
    pub fn shifted_days(self, days: i64) -> Self {
        Self {
            not_before: self.not_before + days * SECONDS_PER_DAY,
            not_after: self.not_after + days * SECONDS_PER_DAY,
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Basic-constraints flavour of the certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateKind {
    /// `CA:true, pathlen:0` with keyCertSign/cRLSign.
    Authority,
    /// `CA:false` with digitalSignature/keyEncipherment.
    EndEntity,
}

/// Everything that goes into a certificate except key material and serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateTemplate {
    pub subject: DistinguishedName,
    pub kind: CertificateKind,
    pub validity: Validity,
    pub san: Vec<SanEntry>,
    /// Adds extendedKeyUsage = serverAuth.
    pub server_auth: bool,
}

impl CertificateTemplate {
    pub fn self_signed_ca(subject: DistinguishedName, validity_days: u32) -> Self {
        Self {
            subject,
            kind: CertificateKind::Authority,
            validity: Validity::days_from_now(validity_days),
            san: Vec::new(),
            server_auth: false,
        }
    }

    pub fn end_entity(subject: DistinguishedName, validity_days: u32, san: Vec<SanEntry>) -> Self {
        Self {
            subject,
            kind: CertificateKind::EndEntity,
            validity: Validity::days_from_now(validity_days),
            san,
            server_auth: false,
        }
    }
}

/// Key (and certificate, unless self-signed) that signs a template.
#[derive(Clone, Copy)]
pub enum Signer<'a> {
    /// Issuer = subject, signed by the subject's own key.
    SelfSigned(&'a PKeyRef<Private>),
    /// Issuer = the authority certificate's subject.
    Authority {
        key: &'a PKeyRef<Private>,
        cert: &'a X509Ref,
    },
}

/// Sign `template` over `subject_key` with a fresh random serial.
///
/// # Errors
/// `PkiError::CertificateBuild` if any OpenSSL step fails, including a
/// signer key that does not match the signer certificate.
pub fn sign<T: HasPublic>(
    template: &CertificateTemplate,
    subject_key: &PKeyRef<T>,
    signer: Signer<'_>,
) -> Result<X509> {
    let (signing_key, issuer_cert) = match signer {
        Signer::SelfSigned(key) => (key, None),
        Signer::Authority { key, cert } => {
            let issuer_key = cert
                .public_key()
                .map_err(|e| PkiError::build("Failed to read issuer public key", e))?;
            if !key.public_eq(&issuer_key) {
                return Err(PkiError::CertificateBuild(
                    "signing key does not match the issuer certificate".to_string(),
                ));
            }
            (key, Some(cert))
        }
    };

    let mut builder =
        X509::builder().map_err(|e| PkiError::build("Failed to create X509 builder", e))?;

    builder
        .set_version(X509_VERSION_3)
        .map_err(|e| PkiError::build("Failed to set version", e))?;

    let serial = random_serial()?;
    builder
        .set_serial_number(&serial)
        .map_err(|e| PkiError::build("Failed to set serial number", e))?;

    let subject_name = template.subject.to_x509_name()?;
    builder
        .set_subject_name(&subject_name)
        .map_err(|e| PkiError::build("Failed to set subject", e))?;

    match issuer_cert {
        Some(cert) => builder.set_issuer_name(cert.subject_name()),
        None => builder.set_issuer_name(&subject_name),
    }
    .map_err(|e| PkiError::build("Failed to set issuer", e))?;

    let not_before = Asn1Time::from_unix(template.validity.not_before as _)
        .map_err(|e| PkiError::build("Failed to create not_before", e))?;
    builder
        .set_not_before(&not_before)
        .map_err(|e| PkiError::build("Failed to set not_before", e))?;

    let not_after = Asn1Time::from_unix(template.validity.not_after as _)
        .map_err(|e| PkiError::build("Failed to create not_after", e))?;
    builder
        .set_not_after(&not_after)
        .map_err(|e| PkiError::build("Failed to set not_after", e))?;

    builder
        .set_pubkey(subject_key)
        .map_err(|e| PkiError::build("Failed to set public key", e))?;

    let (bc, ku) = match template.kind {
        CertificateKind::Authority => (
            BasicConstraints::new().critical().ca().pathlen(0).build(),
            KeyUsage::new()
                .critical()
                .key_cert_sign()
                .crl_sign()
                .digital_signature()
                .build(),
        ),
        CertificateKind::EndEntity => (
            BasicConstraints::new().critical().build(),
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build(),
        ),
    };
    builder
        .append_extension(bc.map_err(|e| PkiError::build("Failed to build BasicConstraints", e))?)
        .map_err(|e| PkiError::build("Failed to add BasicConstraints", e))?;
    builder
        .append_extension(ku.map_err(|e| PkiError::build("Failed to build KeyUsage", e))?)
        .map_err(|e| PkiError::build("Failed to add KeyUsage", e))?;

    if template.server_auth {
        let eku = ExtendedKeyUsage::new()
            .server_auth()
            .build()
            .map_err(|e| PkiError::build("Failed to build ExtendedKeyUsage", e))?;
        builder
            .append_extension(eku)
            .map_err(|e| PkiError::build("Failed to add ExtendedKeyUsage", e))?;
    }

    if !template.san.is_empty() {
        let san = san_extension(&template.san, &builder.x509v3_context(issuer_cert, None))?;
        builder
            .append_extension(san)
            .map_err(|e| PkiError::build("Failed to add SubjectAlternativeName", e))?;
    }

    builder
        .sign(signing_key, MessageDigest::sha256())
        .map_err(|e| PkiError::build("Failed to sign certificate", e))?;

    Ok(builder.build())
}

fn random_serial() -> Result<openssl::asn1::Asn1Integer> {
    let mut serial = BigNum::new().map_err(|e| PkiError::build("Failed to allocate serial", e))?;
    serial
        .rand(SERIAL_NUMBER_BITS, MsbOption::MAYBE_ZERO, false)
        .map_err(|e| PkiError::build("Failed to generate serial", e))?;
    serial
        .to_asn1_integer()
        .map_err(|e| PkiError::build("Failed to encode serial", e))
}

/// Upper-case hex serial, as shown by `openssl x509 -serial`.
pub fn serial_hex(cert: &X509Ref) -> Result<String> {
    cert.serial_number()
        .to_bn()
        .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
        .map_err(|e| PkiError::build("Failed to read serial number", e))
}

/// subjectAltName entries carried by `cert`, in encoding order.
pub fn subject_alt_names(cert: &X509Ref) -> Vec<SanEntry> {
    let Some(names) = cert.subject_alt_names() else {
        return Vec::new();
    };
    names
        .iter()
        .filter_map(|name| {
            if let Some(dns) = name.dnsname() {
                return Some(SanEntry::Dns(dns.to_string()));
            }
            name.ipaddress().and_then(|bytes| match bytes.len() {
                4 => <[u8; 4]>::try_from(bytes).ok().map(|b| SanEntry::Ip(IpAddr::from(b))),
                16 => <[u8; 16]>::try_from(bytes).ok().map(|b| SanEntry::Ip(IpAddr::from(b))),
                _ => None,
            })
        })
        .collect()
}

/// Whether `cert` carries basicConstraints with `CA:true`.
pub fn is_ca(cert: &X509Ref) -> bool {
    // The openssl crate exposes no basicConstraints accessor. Only the line
    // following the extension header is read, so names and SANs never match.
    let Ok(text) = cert.to_text() else {
        return false;
    };
    let text = String::from_utf8_lossy(&text);
    let mut lines = text.lines().map(str::trim);
    while let Some(line) = lines.next() {
        if line.starts_with("X509v3 Basic Constraints") {
            return lines
                .next()
                .map(|value| value.split(',').any(|field| field.trim() == "CA:TRUE"))
                .unwrap_or(false);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen;
    use std::net::Ipv4Addr;

    fn authority() -> (openssl::pkey::PKey<Private>, X509) {
        let key = keygen::generate(2048).unwrap();
        let subject = DistinguishedName::new()
            .with(Nid::COUNTRYNAME, "TW")
            .with(Nid::ORGANIZATIONNAME, "Test CA")
            .with(Nid::COMMONNAME, "Test CA");
        let cert = sign(
            &CertificateTemplate::self_signed_ca(subject, 3650),
            &key,
            Signer::SelfSigned(&key),
        )
        .unwrap();
        (key, cert)
    }

    #[test]
    fn test_self_signed_authority() {
        let (key, cert) = authority();
        assert!(cert.verify(&key).unwrap());
        assert!(is_ca(&cert));
        assert_eq!(
            format_name(cert.subject_name()),
            format_name(cert.issuer_name())
        );
        assert_eq!(format_name(cert.subject_name()), "C=TW,O=Test CA,CN=Test CA");
        assert_eq!(cert.version(), X509_VERSION_3);
    }

    #[test]
    fn test_end_entity_signed_by_authority() {
        let (ca_key, ca_cert) = authority();
        let leaf_key = keygen::generate(2048).unwrap();
        let mut template = CertificateTemplate::end_entity(
            DistinguishedName::common_name("broker"),
            365,
            vec![
                SanEntry::Dns("localhost".into()),
                SanEntry::Ip(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                SanEntry::Dns("broker".into()),
            ],
        );
        template.server_auth = true;

        let cert = sign(
            &template,
            &leaf_key,
            Signer::Authority { key: &ca_key, cert: &ca_cert },
        )
        .unwrap();

        assert!(cert.verify(&ca_key).unwrap());
        assert!(!cert.verify(&leaf_key).unwrap());
        assert!(!is_ca(&cert));
        assert_eq!(
            format_name(cert.issuer_name()),
            format_name(ca_cert.subject_name())
        );
        assert_eq!(subject_alt_names(&cert), template.san);
        assert!(String::from_utf8_lossy(&cert.to_text().unwrap())
            .contains("TLS Web Server Authentication"));
    }

    #[test]
    fn test_mismatched_signer_is_build_error() {
        let (_, ca_cert) = authority();
        let (other_key, _) = authority();
        let leaf_key = keygen::generate(2048).unwrap();
        let template =
            CertificateTemplate::end_entity(DistinguishedName::common_name("dev"), 1, vec![]);
        let err = sign(
            &template,
            &leaf_key,
            Signer::Authority { key: &other_key, cert: &ca_cert },
        )
        .unwrap_err();
        assert!(matches!(err, PkiError::CertificateBuild(_)));
    }

    #[test]
    fn test_serials_are_random() {
        let (key, _) = authority();
        let template = CertificateTemplate::self_signed_ca(DistinguishedName::common_name("x"), 1);
        let a = sign(&template, &key, Signer::SelfSigned(&key)).unwrap();
        let b = sign(&template, &key, Signer::SelfSigned(&key)).unwrap();
        assert_ne!(serial_hex(&a).unwrap(), serial_hex(&b).unwrap());
    }

    #[test]
    fn test_ca_marker_in_names_is_not_a_ca() {
        let (ca_key, ca_cert) = authority();
        let leaf_key = keygen::generate(2048).unwrap();
        let template = CertificateTemplate::end_entity(
            DistinguishedName::common_name("CA:TRUE"),
            30,
            vec![SanEntry::Dns("CA:TRUE".into())],
        );
        let cert = sign(
            &template,
            &leaf_key,
            Signer::Authority { key: &ca_key, cert: &ca_cert },
        )
        .unwrap();

        assert_eq!(format_name(cert.subject_name()), "CN=CA:TRUE");
        let text = String::from_utf8_lossy(&cert.to_text().unwrap()).into_owned();
        assert!(text.contains("CA:FALSE"));
        assert!(text.contains("DNS:CA:TRUE"));
        assert!(!is_ca(&cert));
        assert!(is_ca(&ca_cert));
    }

    #[test]
    fn test_distinguished_name_display() {
        let dn = DistinguishedName::new()
            .with(Nid::COUNTRYNAME, "TW")
            .with(Nid::COMMONNAME, "My Root CA");
        assert_eq!(dn.to_string(), "C=TW,CN=My Root CA");
    }
}
