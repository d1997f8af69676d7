//! On-disk layout for the authority and every leaf identity.
//!
//! ```text
//! <certs_dir>/root_ca/root_ca.key
//! <certs_dir>/root_ca/root_ca.crt
//! <certs_dir>/<identity>/<identity>.key
//! <certs_dir>/<identity>/<identity>.crt
//! <certs_dir>/<identity>/<identity>.csr
//! <certs_dir>/<identity>/root_ca.crt
//! ```
//!
//! Only path resolution and raw I/O live here. Every write replaces the
//! whole file through a temporary sibling and an atomic rename, so readers
//! never observe a half-written key or certificate.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};
use tempfile::NamedTempFile;

use crate::error::{PkiError, Result};

pub const ROOT_CA_DIR_NAME: &str = "root_ca";
pub const ROOT_CA_CERT_FILE: &str = "root_ca.crt";
const LOCK_FILE_NAME: &str = ".lock";

const PRIVATE_KEY_MODE: u32 = 0o600;
const PUBLIC_FILE_MODE: u32 = 0o644;

/// Files belonging to one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPaths {
    pub dir: PathBuf,
    pub key: PathBuf,
    pub cert: PathBuf,
    pub csr: PathBuf,
    /// Distributed copy of the authority certificate.
    pub ca_cert: PathBuf,
}

/// Root of the certificate directory tree.
#[derive(Debug, Clone)]
pub struct CertStore {
    root: PathBuf,
}

impl CertStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths of the authority. Its `ca_cert` is its own certificate and it has no CSR.
    pub fn authority_paths(&self) -> IdentityPaths {
        let dir = self.root.join(ROOT_CA_DIR_NAME);
        let cert = dir.join(ROOT_CA_CERT_FILE);
        IdentityPaths {
            key: dir.join(format!("{}.key", ROOT_CA_DIR_NAME)),
            csr: dir.join(format!("{}.csr", ROOT_CA_DIR_NAME)),
            ca_cert: cert.clone(),
            cert,
            dir,
        }
    }

    pub fn identity_paths(&self, name: &str) -> IdentityPaths {
        let dir = self.root.join(name);
        IdentityPaths {
            key: dir.join(format!("{}.key", name)),
            cert: dir.join(format!("{}.crt", name)),
            csr: dir.join(format!("{}.csr", name)),
            ca_cert: dir.join(ROOT_CA_CERT_FILE),
            dir,
        }
    }

    /// Take the store-wide exclusive lock, blocking until it is free.
    ///
    /// The lock is advisory (`flock`) and released when the guard drops.
    pub fn lock(&self) -> Result<StoreLock> {
        fs::create_dir_all(&self.root).map_err(|e| PkiError::io(&self.root, e))?;
        let path = self.root.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| PkiError::io(&path, e))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive)
            .map_err(|errno| PkiError::io(&path, std::io::Error::from(errno)))?;
        Ok(StoreLock { _file: file })
    }
}

/// Guard for [`CertStore::lock`].
#[derive(Debug)]
pub struct StoreLock {
    _file: File,
}

/// Read a whole file. `Ok(None)` when it does not exist.
pub fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PkiError::io(path, e)),
    }
}

/// Atomically replace `path` with `contents` (mode 0644).
pub fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    write_atomic(path, contents, PUBLIC_FILE_MODE)
}

/// Atomically replace `path` with a private key (mode 0600).
pub fn write_private_key(path: &Path, contents: &[u8]) -> Result<()> {
    write_atomic(path, contents, PRIVATE_KEY_MODE)
}

/// Remove `path`; a missing file is not an error.
pub fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PkiError::io(path, e)),
    }
}

fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| PkiError::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| PkiError::io(dir, e))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .map_err(|e| PkiError::io(tmp.path(), e))?;
    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| PkiError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| PkiError::io(path, e.error))?;
    Ok(())
}
