//! Device identity material: classification, CSR generation and persistence.
//!
//! The store owns the key/certificate pair the transport uses for mTLS. Until
//! the operator issues a device certificate, that pair is the shared bootstrap
//! identity, recognised by its subject common name.
//!
//! # Key handling
//!
//! - Leaving the bootstrap identity always mints a fresh ECDSA P-256 key; the
//!   bootstrap key is shared between devices and never reused.
//! - Renewing an established device identity keeps the current key.
//! - Keys are persisted as SEC1 `EC PRIVATE KEY` PEM. Loading also accepts
//!   PKCS#8 `PRIVATE KEY` PEM.
//!
//! # Persistence
//!
//! [`CertificateStore::write_certificate`] stages both files next to their
//! targets and swaps them in with `rename`. If the second swap fails the first
//! is rolled back, so a failed write leaves the previous pair byte-identical.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use p256::SecretKey;
use rand::rngs::OsRng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use x509_parser::pem::parse_x509_pem;
use zeroize::Zeroizing;

use crate::collaborators::TransportConfig;
use crate::error::{RegistrationError, RegistrationResult};

const CERTIFICATE_PEM_LABEL: &str = "CERTIFICATE";

/// Which identity the current certificate represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityRole {
    /// Shared pre-provisioned registration identity
    Bootstrap,
    /// Unique identity issued to this device by the operator
    Device,
}

impl fmt::Display for IdentityRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityRole::Bootstrap => write!(f, "bootstrap"),
            IdentityRole::Device => write!(f, "device"),
        }
    }
}

/// A validated private key and certificate.
#[derive(Clone)]
pub struct IdentityMaterial {
    key: SecretKey,
    certificate_pem: String,
}

impl IdentityMaterial {
    /// Decode and validate a PEM certificate and private key.
    pub fn from_pem(certificate_pem: &str, key_pem: &str) -> RegistrationResult<Self> {
        // Validates the certificate block up front
        subject_common_name(certificate_pem)?;
        let key = decode_private_key(key_pem)?;

        Ok(Self {
            key,
            certificate_pem: certificate_pem.to_string(),
        })
    }

    pub fn key(&self) -> &SecretKey {
        &self.key
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// Subject common name of the certificate, if it carries one.
    pub fn common_name(&self) -> RegistrationResult<Option<String>> {
        subject_common_name(&self.certificate_pem)
    }

    /// Classify against the bootstrap common name. Derived from the
    /// certificate on every call.
    pub fn role(&self, register_common_name: &str) -> RegistrationResult<IdentityRole> {
        match self.common_name()? {
            Some(cn) if cn == register_common_name => Ok(IdentityRole::Bootstrap),
            _ => Ok(IdentityRole::Device),
        }
    }
}

impl fmt::Debug for IdentityMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityMaterial")
            .field("certificate_pem", &self.certificate_pem)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// CSR to submit plus the private key it was signed with.
pub struct CertificateSigningRequest {
    /// PEM-encoded `CERTIFICATE REQUEST`
    pub csr_pem: String,
    /// SEC1 PEM of the key to persist alongside the issued certificate
    pub key_pem: Zeroizing<String>,
}

impl fmt::Debug for CertificateSigningRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateSigningRequest")
            .field("csr_pem", &self.csr_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Owner of the device's current key/certificate pair.
#[derive(Debug)]
pub struct CertificateStore {
    cert_path: PathBuf,
    key_path: PathBuf,
    register_common_name: String,
    material: RwLock<Option<IdentityMaterial>>,
}

impl CertificateStore {
    /// Create a store for the given paths without loading anything.
    pub fn new(config: &TransportConfig, register_common_name: impl Into<String>) -> Self {
        Self {
            cert_path: config.cert_file.clone(),
            key_path: config.key_file.clone(),
            register_common_name: register_common_name.into(),
            material: RwLock::new(None),
        }
    }

    /// Create a store and load the pair currently on disk.
    ///
    /// Fails with [`RegistrationError::Config`] when the pair cannot be loaded.
    pub fn open(
        config: &TransportConfig,
        register_common_name: impl Into<String>,
    ) -> RegistrationResult<Self> {
        let store = Self::new(config, register_common_name);
        store.reload().map_err(|e| {
            RegistrationError::Config(format!(
                "cannot load identity from {} and {}: {}",
                store.cert_path.display(),
                store.key_path.display(),
                e
            ))
        })?;
        Ok(store)
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Re-read the key/certificate pair from disk.
    pub fn reload(&self) -> RegistrationResult<()> {
        let certificate_pem = fs::read_to_string(&self.cert_path)?;
        let key_pem = Zeroizing::new(fs::read_to_string(&self.key_path)?);
        let material = IdentityMaterial::from_pem(&certificate_pem, &key_pem)?;

        *self.write_material() = Some(material);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.read_material().is_some()
    }

    /// Role of the loaded identity.
    pub fn role(&self) -> RegistrationResult<IdentityRole> {
        self.read_material()
            .as_ref()
            .ok_or_else(not_loaded)?
            .role(&self.register_common_name)
    }

    pub fn is_bootstrap_identity(&self) -> RegistrationResult<bool> {
        Ok(self.role()? == IdentityRole::Bootstrap)
    }

    /// Copy of the loaded private key.
    pub fn current_key(&self) -> RegistrationResult<SecretKey> {
        self.read_material()
            .as_ref()
            .map(|material| material.key().clone())
            .ok_or_else(not_loaded)
    }

    /// Mint a fresh key and a CSR for `device_id`. Does not touch disk.
    pub fn create_device_identity(
        &self,
        device_id: &str,
    ) -> RegistrationResult<CertificateSigningRequest> {
        tracing::debug!(device_id, "Generating new device key");
        let key = SecretKey::random(&mut OsRng);
        signing_request(device_id, &key)
    }

    /// CSR for `device_id` signed with the already established key.
    pub fn renew(
        &self,
        device_id: &str,
        existing_key: &SecretKey,
    ) -> RegistrationResult<CertificateSigningRequest> {
        tracing::debug!(device_id, "Renewing device certificate with current key");
        signing_request(device_id, existing_key)
    }

    /// Validate and persist an issued certificate with its key.
    ///
    /// Nothing is written unless both PEM documents decode. On success the
    /// in-memory identity is replaced by the new pair.
    pub fn write_certificate(
        &self,
        certificate_pem: &str,
        key_pem: &str,
    ) -> RegistrationResult<()> {
        let material = IdentityMaterial::from_pem(certificate_pem, key_pem)?;

        let mut current = self.write_material();
        persist_pair(
            &self.cert_path,
            certificate_pem.as_bytes(),
            &self.key_path,
            key_pem.as_bytes(),
        )?;
        *current = Some(material);

        tracing::info!(
            cert_path = %self.cert_path.display(),
            key_path = %self.key_path.display(),
            "Device certificate written"
        );
        Ok(())
    }

    fn read_material(&self) -> RwLockReadGuard<'_, Option<IdentityMaterial>> {
        self.material
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_material(&self) -> RwLockWriteGuard<'_, Option<IdentityMaterial>> {
        self.material
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn not_loaded() -> RegistrationError {
    RegistrationError::Config("no identity loaded".to_string())
}

fn crypto_error(context: &str, err: impl fmt::Display) -> RegistrationError {
    RegistrationError::Crypto(format!("{}: {}", context, err))
}

fn subject_common_name(certificate_pem: &str) -> RegistrationResult<Option<String>> {
    let (_, pem) = parse_x509_pem(certificate_pem.as_bytes())
        .map_err(|e| crypto_error("invalid certificate PEM", e))?;
    if pem.label != CERTIFICATE_PEM_LABEL {
        return Err(RegistrationError::Crypto(format!(
            "expected a {} block, found {}",
            CERTIFICATE_PEM_LABEL, pem.label
        )));
    }

    let certificate = pem
        .parse_x509()
        .map_err(|e| crypto_error("invalid certificate", e))?;
    let common_name = certificate
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    Ok(common_name)
}

fn decode_private_key(key_pem: &str) -> RegistrationResult<SecretKey> {
    SecretKey::from_sec1_pem(key_pem)
        .or_else(|_| SecretKey::from_pkcs8_pem(key_pem))
        .map_err(|e| crypto_error("cannot decode private key", e))
}

fn signing_request(
    device_id: &str,
    key: &SecretKey,
) -> RegistrationResult<CertificateSigningRequest> {
    let pkcs8 = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| crypto_error("cannot encode private key", e))?;
    let key_pair =
        KeyPair::from_pem(&pkcs8).map_err(|e| crypto_error("cannot load signing key", e))?;

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| crypto_error("invalid CSR parameters", e))?;
    let mut subject = DistinguishedName::new();
    subject.push(DnType::CommonName, device_id);
    params.distinguished_name = subject;

    let csr_pem = params
        .serialize_request(&key_pair)
        .and_then(|csr| csr.pem())
        .map_err(|e| crypto_error("cannot create certificate request", e))?;
    let key_pem = key
        .to_sec1_pem(LineEnding::LF)
        .map_err(|e| crypto_error("cannot encode private key", e))?;

    Ok(CertificateSigningRequest { csr_pem, key_pem })
}

fn staged_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Create `path` with `mode` already applied, then write `data`.
fn write_file(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    std::os::unix::fs::OpenOptionsExt::mode(&mut options, mode);

    let mut file = options.open(path)?;

    // A leftover staged file keeps its old mode
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    file.write_all(data)?;
    file.sync_all()
}

/// Replace both files or neither.
fn persist_pair(cert_path: &Path, cert: &[u8], key_path: &Path, key: &[u8]) -> io::Result<()> {
    let cert_staged = staged_path(cert_path);
    let key_staged = staged_path(key_path);

    let result = swap_in_pair(cert_path, &cert_staged, cert, key_path, &key_staged, key);
    if result.is_err() {
        let _ = fs::remove_file(&cert_staged);
        let _ = fs::remove_file(&key_staged);
    }
    result
}

fn swap_in_pair(
    cert_path: &Path,
    cert_staged: &Path,
    cert: &[u8],
    key_path: &Path,
    key_staged: &Path,
    key: &[u8],
) -> io::Result<()> {
    write_file(cert_staged, cert, 0o644)?;
    write_file(key_staged, key, 0o600)?;

    let previous_cert = match fs::read(cert_path) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    fs::rename(cert_staged, cert_path)?;
    if let Err(err) = fs::rename(key_staged, key_path) {
        if let Err(rollback) = restore(cert_path, cert_staged, previous_cert.as_deref()) {
            tracing::error!(
                cert_path = %cert_path.display(),
                error = %rollback,
                "Failed to roll back certificate after key write failure"
            );
        }
        return Err(err);
    }
    Ok(())
}

fn restore(path: &Path, staged: &Path, previous: Option<&[u8]>) -> io::Result<()> {
    match previous {
        Some(bytes) => {
            write_file(staged, bytes, 0o644)?;
            fs::rename(staged, path)
        }
        None => fs::remove_file(path),
    }
}
