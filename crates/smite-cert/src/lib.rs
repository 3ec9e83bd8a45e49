//! Certificate authority and identity management for the secure channel
//!
//! The panel owns a self-signed CA whose private key never leaves the panel
//! host. The CA issues one leaf certificate for the panel itself and one per
//! node; both sides present their leaf during the mutual TLS handshake and
//! trust only certificates chaining to that CA.

pub mod authority;
pub mod fs;
pub mod inspect;

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

pub use authority::{
    validate_subject, CertificateAuthority, Identity, IdentityOptions, IdentityPaths,
    NodeCertificate, CA_CERT_FILE, CA_KEY_FILE, NODE_CERT_FILE, NODE_KEY_FILE, PANEL_CERT_FILE,
    PANEL_KEY_FILE, RSA_KEY_BITS,
};
pub use fs::resolve_path;
pub use inspect::{inspect_certificate, inspect_certificate_der, CertificateInfo};

/// Identity errors
///
/// All of these are fatal at startup: a process must not serve the secure
/// channel with a missing or corrupt identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Certificate generation failed: {0}")]
    Generation(String),

    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing to persist empty file {}", .0.display())]
    EmptyWrite(PathBuf),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("Invalid certificate subject '{subject}': {reason}")]
    InvalidSubject {
        subject: String,
        reason: &'static str,
    },

    #[error("Certificate for '{subject}' expired at {not_after}")]
    Expired {
        subject: String,
        not_after: DateTime<Utc>,
    },

    #[error("No usable CA in {}: {reason}", .dir.display())]
    CaUnavailable { dir: PathBuf, reason: String },

    #[error("Cannot determine working directory: {0}")]
    WorkingDirectory(#[source] std::io::Error),
}

impl IdentityError {
    /// Map an IO failure on `path`, keeping permission problems distinct
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            IdentityError::PermissionDenied(path)
        } else {
            IdentityError::Io { path, source }
        }
    }
}

impl From<rcgen::Error> for IdentityError {
    fn from(err: rcgen::Error) -> Self {
        IdentityError::Generation(err.to_string())
    }
}
