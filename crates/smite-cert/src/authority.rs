//! Panel certificate authority and leaf issuance

use crate::fs::{ensure_dir, read_optional, read_required, resolve_path, write_atomic, FileMode};
use crate::inspect::{inspect_certificate, is_signed_by, matches_key, CertificateInfo};
use crate::IdentityError;
use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";
pub const PANEL_CERT_FILE: &str = "panel.crt";
pub const PANEL_KEY_FILE: &str = "panel.key";
pub const NODE_CERT_FILE: &str = "node.crt";
pub const NODE_KEY_FILE: &str = "node.key";

const CA_COMMON_NAME: &str = "Smite Panel CA";
const ORGANIZATION: &str = "Smite";
const MAX_SUBJECT_LEN: usize = 64;

/// Modulus size of every generated key
pub const RSA_KEY_BITS: usize = 2048;

/// Serializes certificate generation across the process so that concurrent
/// first-boot callers never race to write the CA
static GENERATION_LOCK: Mutex<()> = Mutex::new(());

fn generation_guard() -> std::sync::MutexGuard<'static, ()> {
    // Nothing is protected by the lock itself, so a poisoned guard is usable.
    GENERATION_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Validity policy for generated certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityOptions {
    pub validity_days: u32,
    /// Certificates closer than this to expiry are regenerated
    pub renewal_threshold_days: u32,
}

impl Default for IdentityOptions {
    fn default() -> Self {
        Self {
            validity_days: 365,
            renewal_threshold_days: 30,
        }
    }
}

/// Locations of a leaf certificate, its key and the CA that issued it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl IdentityPaths {
    /// Standard node layout inside `dir`
    pub fn node_in(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            cert: dir.join(NODE_CERT_FILE),
            key: dir.join(NODE_KEY_FILE),
            ca: dir.join(CA_CERT_FILE),
        }
    }

    /// Resolve relative entries against the working directory
    pub fn resolved(&self) -> Result<Self, IdentityError> {
        Ok(Self {
            cert: resolve_path(&self.cert)?,
            key: resolve_path(&self.key)?,
            ca: resolve_path(&self.ca)?,
        })
    }
}

/// A CA-signed leaf certificate, its private key and the CA certificate
#[derive(Debug, Clone)]
pub struct Identity {
    pub paths: IdentityPaths,
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_pem: String,
    pub info: CertificateInfo,
    /// True when this call generated fresh material
    pub regenerated: bool,
}

impl Identity {
    /// Load an identity that was issued elsewhere (a node's certificate)
    ///
    /// Nodes cannot mint certificates, so an expired or foreign certificate
    /// is an error rather than a trigger for regeneration.
    pub fn load(paths: &IdentityPaths) -> Result<Self, IdentityError> {
        let paths = paths.resolved()?;
        let cert_pem = read_required(&paths.cert)?;
        let key_pem = read_required(&paths.key)?;
        let ca_pem = read_required(&paths.ca)?;

        let info = inspect_certificate(&cert_pem)?;
        if info.is_expired() {
            return Err(IdentityError::Expired {
                subject: info.subject_cn,
                not_after: info.not_after,
            });
        }
        if !is_signed_by(&cert_pem, &ca_pem)? {
            return Err(IdentityError::InvalidCertificate(format!(
                "{} is not issued by the CA in {}",
                paths.cert.display(),
                paths.ca.display()
            )));
        }

        let key = KeyPair::from_pem(&key_pem).map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        if !matches_key(&cert_pem, &key)? {
            return Err(IdentityError::InvalidKey(format!(
                "{} does not match {}",
                paths.key.display(),
                paths.cert.display()
            )));
        }

        if info.needs_renewal(IdentityOptions::default().renewal_threshold_days) {
            warn!(
                subject = %info.subject_cn,
                days_left = info.days_until_expiry(),
                "Identity certificate expires soon, ask the panel operator for a new one"
            );
        }

        Ok(Self {
            paths,
            cert_pem,
            key_pem,
            ca_pem,
            info,
            regenerated: false,
        })
    }
}

/// A freshly issued node certificate bundle
///
/// Holds everything a node needs to join: its leaf certificate, the matching
/// private key, and the CA certificate to trust. Never contains the CA key.
#[derive(Debug, Clone)]
pub struct NodeCertificate {
    pub subject: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub public_key_pem: String,
    pub ca_cert_pem: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl NodeCertificate {
    /// Write `node.crt`, `node.key` and `ca.crt` into `dir`
    pub fn write_to(&self, dir: impl AsRef<Path>) -> Result<IdentityPaths, IdentityError> {
        let dir = resolve_path(dir)?;
        ensure_dir(&dir)?;
        let paths = IdentityPaths::node_in(&dir);

        write_atomic(&paths.key, self.key_pem.as_bytes(), FileMode::Private)?;
        write_atomic(&paths.cert, self.cert_pem.as_bytes(), FileMode::Public)?;
        write_atomic(&paths.ca, self.ca_cert_pem.as_bytes(), FileMode::Public)?;

        info!(subject = %self.subject, dir = %dir.display(), "Wrote node identity");
        Ok(paths)
    }
}

/// Check that a name is usable as a certificate common name and node id
pub fn validate_subject(subject: &str) -> Result<(), IdentityError> {
    let reason = if subject.is_empty() {
        Some("must not be empty")
    } else if subject.len() > MAX_SUBJECT_LEN {
        Some("longer than 64 characters")
    } else if !subject
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Some("only ASCII letters, digits, '-', '_' and '.' are allowed")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(IdentityError::InvalidSubject {
            subject: subject.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// The panel's certificate authority
///
/// Loaded from (or created in) a directory holding `ca.crt` and `ca.key`.
pub struct CertificateAuthority {
    dir: PathBuf,
    options: IdentityOptions,
    cert_pem: String,
    key: KeyPair,
    /// CA certificate re-materialized from `cert_pem` for signing leaves
    issuer: Certificate,
    info: CertificateInfo,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("dir", &self.dir)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// What [`CertificateAuthority::load`] found on disk
enum StoredCa {
    Usable(CertificateAuthority),
    Missing,
    Unusable(String),
    DueForRenewal(DateTime<Utc>),
}

impl CertificateAuthority {
    /// Load the CA from `dir`, generating a new one if it is missing,
    /// unreadable, or within the renewal threshold of expiry
    pub fn ensure(dir: impl AsRef<Path>, options: IdentityOptions) -> Result<Self, IdentityError> {
        let dir = resolve_path(dir)?;
        let _guard = generation_guard();
        ensure_dir(&dir)?;

        match Self::load(&dir, options)? {
            StoredCa::Usable(ca) => {
                debug!(dir = %dir.display(), days_left = ca.info.days_until_expiry(), "Reusing existing CA");
                return Ok(ca);
            }
            StoredCa::Missing => {}
            StoredCa::Unusable(reason) => {
                warn!(dir = %dir.display(), "{}, regenerating", reason);
            }
            StoredCa::DueForRenewal(not_after) => {
                info!(dir = %dir.display(), not_after = %not_after, "CA certificate is due for renewal, regenerating");
            }
        }

        Self::generate(dir, options)
    }

    /// Load the CA from `dir` without ever writing to it
    ///
    /// Fails with [`IdentityError::CaUnavailable`] where [`Self::ensure`]
    /// would have generated a new CA.
    pub fn open(dir: impl AsRef<Path>, options: IdentityOptions) -> Result<Self, IdentityError> {
        let dir = resolve_path(dir)?;
        let _guard = generation_guard();

        let reason = match Self::load(&dir, options)? {
            StoredCa::Usable(ca) => return Ok(ca),
            StoredCa::Missing => "CA certificate or key is missing".to_string(),
            StoredCa::Unusable(reason) => reason,
            StoredCa::DueForRenewal(not_after) => format!("CA certificate is due for renewal (expires {})", not_after),
        };
        Err(IdentityError::CaUnavailable { dir, reason })
    }

    fn load(dir: &Path, options: IdentityOptions) -> Result<StoredCa, IdentityError> {
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        let (Some(cert_pem), Some(key_pem)) = (read_optional(&cert_path)?, read_optional(&key_path)?)
        else {
            return Ok(StoredCa::Missing);
        };

        let info = match inspect_certificate(&cert_pem) {
            Ok(info) => info,
            Err(e) => {
                return Ok(StoredCa::Unusable(format!("CA certificate {} is corrupt: {}", cert_path.display(), e)));
            }
        };
        if !info.is_ca {
            return Ok(StoredCa::Unusable(format!(
                "CA certificate {} lacks CA basic constraints",
                cert_path.display()
            )));
        }
        if info.needs_renewal(options.renewal_threshold_days) {
            return Ok(StoredCa::DueForRenewal(info.not_after));
        }

        let key = match KeyPair::from_pem(&key_pem) {
            Ok(key) => key,
            Err(e) => {
                return Ok(StoredCa::Unusable(format!("CA key {} is corrupt: {}", key_path.display(), e)));
            }
        };
        if !matches_key(&cert_pem, &key)? {
            return Ok(StoredCa::Unusable(format!(
                "CA key {} does not match CA certificate",
                key_path.display()
            )));
        }

        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| IdentityError::InvalidCertificate(e.to_string()))?;
        let issuer = params.self_signed(&key)?;

        Ok(StoredCa::Usable(Self {
            dir: dir.to_path_buf(),
            options,
            cert_pem,
            key,
            issuer,
            info,
        }))
    }

    fn generate(dir: PathBuf, options: IdentityOptions) -> Result<Self, IdentityError> {
        let key = generate_key()?;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name = distinguished_name(CA_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));
        set_validity(&mut params, options.validity_days, None)?;

        let issuer = params.self_signed(&key)?;
        let cert_pem = issuer.pem();

        // Key first: a crash before the certificate lands leaves no CA at all,
        // which the next start regenerates cleanly.
        write_atomic(&dir.join(CA_KEY_FILE), key.serialize_pem().as_bytes(), FileMode::Private)?;
        write_atomic(&dir.join(CA_CERT_FILE), cert_pem.as_bytes(), FileMode::Public)?;

        let info = inspect_certificate(&cert_pem)?;
        info!(
            dir = %dir.display(),
            not_after = %info.not_after,
            "Generated new panel CA; previously issued node certificates are no longer trusted"
        );

        Ok(Self {
            dir,
            options,
            cert_pem,
            key,
            issuer,
            info,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILE)
    }

    pub fn info(&self) -> &CertificateInfo {
        &self.info
    }

    /// Return the panel's leaf identity, reusing the files on disk when they
    /// are parsable, issued by this CA, and not close to expiry
    pub fn ensure_identity(&self, subject: &str) -> Result<Identity, IdentityError> {
        validate_subject(subject)?;
        let _guard = generation_guard();

        let paths = IdentityPaths {
            cert: self.dir.join(PANEL_CERT_FILE),
            key: self.dir.join(PANEL_KEY_FILE),
            ca: self.cert_path(),
        };

        if let Some(identity) = self.load_identity(&paths, subject)? {
            debug!(subject, days_left = identity.info.days_until_expiry(), "Reusing panel identity");
            return Ok(identity);
        }

        let sans = vec![
            subject.to_string(),
            "localhost".to_string(),
            "127.0.0.1".to_string(),
        ];
        let (cert, key) = self.sign_leaf(subject, sans)?;
        let cert_pem = cert.pem();
        let key_pem = key.serialize_pem();

        write_atomic(&paths.key, key_pem.as_bytes(), FileMode::Private)?;
        write_atomic(&paths.cert, cert_pem.as_bytes(), FileMode::Public)?;

        let info = inspect_certificate(&cert_pem)?;
        info!(subject, not_after = %info.not_after, "Issued panel identity");

        Ok(Identity {
            paths,
            cert_pem,
            key_pem,
            ca_pem: self.cert_pem.clone(),
            info,
            regenerated: true,
        })
    }

    fn load_identity(
        &self,
        paths: &IdentityPaths,
        subject: &str,
    ) -> Result<Option<Identity>, IdentityError> {
        let (Some(cert_pem), Some(key_pem)) = (read_optional(&paths.cert)?, read_optional(&paths.key)?)
        else {
            return Ok(None);
        };

        let info = match inspect_certificate(&cert_pem) {
            Ok(info) => info,
            Err(e) => {
                warn!(path = %paths.cert.display(), error = %e, "Identity certificate is corrupt, regenerating");
                return Ok(None);
            }
        };
        if info.subject_cn != subject {
            info!(expected = subject, found = %info.subject_cn, "Identity subject changed, regenerating");
            return Ok(None);
        }
        if info.needs_renewal(self.options.renewal_threshold_days) {
            info!(subject, not_after = %info.not_after, "Identity is due for renewal, regenerating");
            return Ok(None);
        }
        if !is_signed_by(&cert_pem, &self.cert_pem)? {
            info!(subject, "Identity was issued by a previous CA, regenerating");
            return Ok(None);
        }

        let key = match KeyPair::from_pem(&key_pem) {
            Ok(key) => key,
            Err(e) => {
                warn!(path = %paths.key.display(), error = %e, "Identity key is corrupt, regenerating");
                return Ok(None);
            }
        };
        if !matches_key(&cert_pem, &key)? {
            warn!(path = %paths.key.display(), "Identity key does not match certificate, regenerating");
            return Ok(None);
        }

        Ok(Some(Identity {
            paths: paths.clone(),
            cert_pem,
            key_pem,
            ca_pem: self.cert_pem.clone(),
            info,
            regenerated: false,
        }))
    }

    /// Issue a leaf certificate for a node
    ///
    /// The node id becomes the certificate's common name; the panel compares
    /// it against the id a node announces when it connects.
    pub fn issue_node_certificate(&self, node_id: &str) -> Result<NodeCertificate, IdentityError> {
        validate_subject(node_id)?;

        let (cert, key) = self.sign_leaf(node_id, Vec::new())?;
        let cert_pem = cert.pem();
        let info = inspect_certificate(&cert_pem)?;

        info!(node_id, not_after = %info.not_after, "Issued node certificate");

        Ok(NodeCertificate {
            subject: node_id.to_string(),
            cert_pem,
            key_pem: key.serialize_pem(),
            public_key_pem: key.public_key_pem(),
            ca_cert_pem: self.cert_pem.clone(),
            issuer: self.info.subject_cn.clone(),
            not_before: info.not_before,
            not_after: info.not_after,
        })
    }

    fn sign_leaf(
        &self,
        subject: &str,
        sans: Vec<String>,
    ) -> Result<(Certificate, KeyPair), IdentityError> {
        let key = generate_key()?;

        let mut params = CertificateParams::new(sans)?;
        params.distinguished_name = distinguished_name(subject);
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(SerialNumber::from(rand::random::<u64>()));
        set_validity(&mut params, self.options.validity_days, Some(self.info.not_after))?;

        let cert = params.signed_by(&key, &self.issuer, &self.key)?;
        Ok((cert, key))
    }
}

/// Fresh RSA key for a CA or leaf, signing with SHA-256
fn generate_key() -> Result<KeyPair, IdentityError> {
    let private = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
        .map_err(|e| IdentityError::Generation(format!("RSA key generation: {}", e)))?;
    let pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| IdentityError::Generation(format!("PKCS#8 encoding: {}", e)))?;
    Ok(KeyPair::from_pem_and_sign_algo(&pem, &PKCS_RSA_SHA256)?)
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn
}

/// Set the validity window, never extending past `cap` when given
fn set_validity(
    params: &mut CertificateParams,
    validity_days: u32,
    cap: Option<DateTime<Utc>>,
) -> Result<(), IdentityError> {
    let now = Utc::now();
    // allow for small clock differences between panel and nodes
    let not_before = now - chrono::Duration::minutes(5);
    let mut not_after = now + chrono::Duration::days(i64::from(validity_days));
    if let Some(cap) = cap {
        not_after = not_after.min(cap);
    }

    params.not_before = offset_datetime(not_before)?;
    params.not_after = offset_datetime(not_after)?;
    Ok(())
}

fn offset_datetime(at: DateTime<Utc>) -> Result<time::OffsetDateTime, IdentityError> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| IdentityError::Generation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ca_in(dir: &TempDir) -> CertificateAuthority {
        CertificateAuthority::ensure(dir.path(), IdentityOptions::default()).unwrap()
    }

    #[test]
    fn test_ensure_creates_ca_files() {
        let dir = TempDir::new().unwrap();
        let ca = ca_in(&dir);

        assert!(dir.path().join(CA_CERT_FILE).exists());
        assert!(dir.path().join(CA_KEY_FILE).exists());
        assert!(ca.info().is_ca);
        assert_eq!(ca.info().subject_cn, CA_COMMON_NAME);
        assert_eq!(ca.info().key_bits, RSA_KEY_BITS);
        assert!(ca.info().days_until_expiry() >= 364);
    }

    #[test]
    fn test_ensure_reuses_existing_ca() {
        let dir = TempDir::new().unwrap();
        let first = ca_in(&dir);
        let second = ca_in(&dir);

        assert_eq!(first.cert_pem(), second.cert_pem());
    }

    #[test]
    fn test_ensure_identity_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ca = ca_in(&dir);

        let first = ca.ensure_identity("panel.example.com").unwrap();
        assert!(first.regenerated);
        assert!(!first.info.is_ca);
        assert_eq!(first.info.issuer_cn, CA_COMMON_NAME);

        let second = ca.ensure_identity("panel.example.com").unwrap();
        assert!(!second.regenerated);
        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(first.key_pem, second.key_pem);
    }

    #[test]
    fn test_corrupt_certificate_triggers_regeneration() {
        let dir = TempDir::new().unwrap();
        let ca = ca_in(&dir);
        let first = ca.ensure_identity("panel").unwrap();

        std::fs::write(&first.paths.cert, "garbage").unwrap();
        let second = ca.ensure_identity("panel").unwrap();

        assert!(second.regenerated);
        assert_ne!(first.cert_pem, second.cert_pem);
        assert!(is_signed_by(&second.cert_pem, ca.cert_pem()).unwrap());
    }

    #[test]
    fn test_deleted_certificate_triggers_regeneration() {
        let dir = TempDir::new().unwrap();
        let ca = ca_in(&dir);
        let first = ca.ensure_identity("panel").unwrap();

        std::fs::remove_file(&first.paths.cert).unwrap();
        assert!(ca.ensure_identity("panel").unwrap().regenerated);
    }

    #[test]
    fn test_new_ca_invalidates_panel_identity() {
        let dir = TempDir::new().unwrap();
        let old = ca_in(&dir).ensure_identity("panel").unwrap();

        std::fs::remove_file(dir.path().join(CA_CERT_FILE)).unwrap();
        let ca = ca_in(&dir);
        let fresh = ca.ensure_identity("panel").unwrap();

        assert!(fresh.regenerated);
        assert!(!is_signed_by(&old.cert_pem, ca.cert_pem()).unwrap());
        assert!(is_signed_by(&fresh.cert_pem, ca.cert_pem()).unwrap());
    }

    #[test]
    fn test_renewal_threshold_beyond_validity_regenerates() {
        let dir = TempDir::new().unwrap();
        let short = IdentityOptions {
            validity_days: 10,
            renewal_threshold_days: 30,
        };
        let first = CertificateAuthority::ensure(dir.path(), short).unwrap();
        let second = CertificateAuthority::ensure(dir.path(), short).unwrap();

        assert_ne!(first.cert_pem(), second.cert_pem());
    }

    #[test]
    fn test_open_never_creates_a_ca() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("certs");

        let err = CertificateAuthority::open(&missing, IdentityOptions::default()).unwrap_err();
        assert!(matches!(err, IdentityError::CaUnavailable { .. }));
        assert!(!missing.exists());

        let err = CertificateAuthority::open(dir.path(), IdentityOptions::default()).unwrap_err();
        assert!(matches!(err, IdentityError::CaUnavailable { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_open_leaves_a_ca_due_for_renewal_alone() {
        let dir = TempDir::new().unwrap();
        let short = IdentityOptions {
            validity_days: 10,
            renewal_threshold_days: 30,
        };
        let ca = CertificateAuthority::ensure(dir.path(), short).unwrap();

        let err = CertificateAuthority::open(dir.path(), short).unwrap_err();
        match err {
            IdentityError::CaUnavailable { reason, .. } => assert!(reason.contains("renewal")),
            other => panic!("Expected CaUnavailable, got {:?}", other),
        }
        let on_disk = std::fs::read_to_string(dir.path().join(CA_CERT_FILE)).unwrap();
        assert_eq!(on_disk, ca.cert_pem());
    }

    #[test]
    fn test_open_corrupt_ca_is_refused_untouched() {
        let dir = TempDir::new().unwrap();
        ca_in(&dir);
        std::fs::write(dir.path().join(CA_CERT_FILE), "garbage").unwrap();

        let err = CertificateAuthority::open(dir.path(), IdentityOptions::default()).unwrap_err();
        assert!(matches!(err, IdentityError::CaUnavailable { .. }));
        assert_eq!(std::fs::read_to_string(dir.path().join(CA_CERT_FILE)).unwrap(), "garbage");
    }

    #[test]
    fn test_open_loads_a_valid_ca() {
        let dir = TempDir::new().unwrap();
        let ca = ca_in(&dir);

        let opened = CertificateAuthority::open(dir.path(), IdentityOptions::default()).unwrap();
        assert_eq!(opened.cert_pem(), ca.cert_pem());
        let node = opened.issue_node_certificate("node-1").unwrap();
        assert!(is_signed_by(&node.cert_pem, ca.cert_pem()).unwrap());
    }

    #[test]
    fn test_issue_node_certificate() {
        let dir = TempDir::new().unwrap();
        let ca = ca_in(&dir);

        let node = ca.issue_node_certificate("node-1").unwrap();
        assert_eq!(node.subject, "node-1");
        assert_eq!(inspect_certificate(&node.cert_pem).unwrap().key_bits, RSA_KEY_BITS);
        assert_eq!(node.issuer, CA_COMMON_NAME);
        assert_eq!(node.ca_cert_pem, ca.cert_pem());
        assert!(node.not_after <= ca.info().not_after);
        assert_ne!(node.key_pem, ca.key.serialize_pem());
        assert!(node.public_key_pem.contains("PUBLIC KEY"));

        let out = TempDir::new().unwrap();
        let paths = node.write_to(out.path()).unwrap();
        let identity = Identity::load(&paths).unwrap();
        assert_eq!(identity.info.subject_cn, "node-1");
        assert!(!identity.regenerated);
    }

    #[test]
    fn test_foreign_node_certificate_rejected() {
        let panel_dir = TempDir::new().unwrap();
        let rogue_dir = TempDir::new().unwrap();
        let rogue = ca_in(&rogue_dir).issue_node_certificate("node-1").unwrap();
        let ca = ca_in(&panel_dir);

        let out = TempDir::new().unwrap();
        let paths = rogue.write_to(out.path()).unwrap();
        std::fs::write(&paths.ca, ca.cert_pem()).unwrap();

        assert!(matches!(
            Identity::load(&paths),
            Err(IdentityError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_invalid_subjects_rejected() {
        let dir = TempDir::new().unwrap();
        let ca = ca_in(&dir);

        assert!(ca.issue_node_certificate("").is_err());
        assert!(ca.issue_node_certificate("node 1").is_err());
        assert!(ca.issue_node_certificate(&"n".repeat(65)).is_err());
        assert!(ca.issue_node_certificate("node_1.eu-west").is_ok());
    }

    #[test]
    fn test_concurrent_first_boot_agrees_on_one_ca() {
        let dir = TempDir::new().unwrap();

        let pems: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        CertificateAuthority::ensure(dir.path(), IdentityOptions::default())
                            .unwrap()
                            .cert_pem()
                            .to_string()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(pems.windows(2).all(|w| w[0] == w[1]));
    }
}
