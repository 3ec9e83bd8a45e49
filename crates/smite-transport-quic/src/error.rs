//! Secure channel errors

use chrono::{DateTime, Utc};
use smite_cert::IdentityError;
use std::net::SocketAddr;
use thiserror::Error;

/// Channel-level errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Peer certificate rejected: {0}")]
    CertificateRejected(String),

    #[error("Peer identity mismatch: expected '{expected}', got '{actual}'")]
    IdentityMismatch { expected: String, actual: String },

    #[error("Certificate for '{subject}' expired at {not_after}")]
    CertificateExpired {
        subject: String,
        not_after: DateTime<Utc>,
    },

    #[error("Identity error: {0}")]
    Identity(IdentityError),

    #[error("Handshake with {0} timed out")]
    HandshakeTimeout(SocketAddr),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ChannelError {
    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChannelError::HandshakeTimeout(_)
                | ChannelError::ConnectionError(_)
                | ChannelError::ConnectionClosed
                | ChannelError::StreamClosed
                | ChannelError::Timeout(_)
                | ChannelError::IoError(_)
        )
    }
}

impl From<IdentityError> for ChannelError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::Expired { subject, not_after } => {
                ChannelError::CertificateExpired { subject, not_after }
            }
            other => ChannelError::Identity(other),
        }
    }
}

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Crypto (TLS alert) errors occupy transport error codes 0x100-0x1ff
fn is_crypto_code(code: quinn::TransportErrorCode) -> bool {
    (0x100..0x200).contains(&u64::from(code))
}

/// Map a quinn connection failure, singling out certificate rejections
pub(crate) fn from_connection_error(err: quinn::ConnectionError) -> ChannelError {
    match &err {
        quinn::ConnectionError::TransportError(e) if is_crypto_code(e.code) => {
            ChannelError::CertificateRejected(e.to_string())
        }
        quinn::ConnectionError::ConnectionClosed(close) if is_crypto_code(close.error_code) => {
            ChannelError::CertificateRejected(close.to_string())
        }
        quinn::ConnectionError::ApplicationClosed(_)
        | quinn::ConnectionError::LocallyClosed
        | quinn::ConnectionError::Reset => ChannelError::ConnectionClosed,
        _ => ChannelError::ConnectionError(err.to_string()),
    }
}
