//! Tunnel operation errors

use smite_proto::{InvalidTunnelId, TunnelState, TunnelType};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why usage could not be sampled for a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageUnavailableReason {
    /// Usage is only collected for Active tunnels
    NotActive(TunnelState),
    /// The adapter cannot meter this tunnel
    Unsupported,
    /// The adapter supports metering but the read failed
    Backend(String),
}

impl fmt::Display for UsageUnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageUnavailableReason::NotActive(state) => write!(f, "tunnel is {}", state),
            UsageUnavailableReason::Unsupported => f.write_str("adapter does not report usage"),
            UsageUnavailableReason::Backend(reason) => write!(f, "backend error: {}", reason),
        }
    }
}

/// Errors from tunnel lifecycle and usage operations
#[derive(Debug, Clone, Error)]
pub enum TunnelError {
    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("Unsupported tunnel type '{0}'")]
    UnsupportedTunnelType(String),

    #[error(transparent)]
    InvalidTunnelId(#[from] InvalidTunnelId),

    #[error("Invalid {tunnel_type} spec for tunnel {tunnel_id}: {reason}")]
    InvalidSpec {
        tunnel_id: String,
        tunnel_type: TunnelType,
        reason: String,
    },

    #[error("Tunnel {tunnel_id} would take {resource}, already used by tunnel {owner}")]
    BackendConflict {
        tunnel_id: String,
        resource: String,
        owner: String,
    },

    #[error("Failed to apply tunnel {tunnel_id}: {reason}")]
    Apply { tunnel_id: String, reason: String },

    #[error("Failed to remove tunnel {tunnel_id}: {reason}")]
    Remove { tunnel_id: String, reason: String },

    #[error("Backend query for tunnel {tunnel_id} failed: {reason}")]
    Backend { tunnel_id: String, reason: String },

    #[error("Usage unavailable for tunnel {tunnel_id}: {reason}")]
    UsageUnavailable {
        tunnel_id: String,
        reason: UsageUnavailableReason,
    },

    #[error("{operation} of tunnel {tunnel_id} timed out after {timeout:?}")]
    Timeout {
        tunnel_id: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Tunnel {tunnel_id} cannot move from {from} to {to}")]
    InvalidTransition {
        tunnel_id: String,
        from: TunnelState,
        to: TunnelState,
    },

    #[error("Registry persistence failed: {0}")]
    Persistence(String),

    #[error("Operation on tunnel {tunnel_id} aborted: {reason}")]
    Aborted { tunnel_id: String, reason: String },
}

impl TunnelError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            TunnelError::NotFound(_) => "TUNNEL_NOT_FOUND",
            TunnelError::UnsupportedTunnelType(_) => "UNSUPPORTED_TUNNEL_TYPE",
            TunnelError::InvalidTunnelId(_) => "INVALID_TUNNEL_ID",
            TunnelError::InvalidSpec { .. } => "INVALID_SPEC",
            TunnelError::BackendConflict { .. } => "BACKEND_CONFLICT",
            TunnelError::Apply { .. } => "TUNNEL_APPLY_FAILED",
            TunnelError::Remove { .. } => "TUNNEL_REMOVE_FAILED",
            TunnelError::Backend { .. } => "BACKEND_ERROR",
            TunnelError::UsageUnavailable { .. } => "USAGE_UNAVAILABLE",
            TunnelError::Timeout { .. } => "TIMEOUT",
            TunnelError::InvalidTransition { .. } => "INVALID_TRANSITION",
            TunnelError::Persistence(_) => "PERSISTENCE_FAILED",
            TunnelError::Aborted { .. } => "OPERATION_ABORTED",
        }
    }

    /// Whether the caller may retry the same request later
    ///
    /// The control plane never retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TunnelError::Timeout { .. } | TunnelError::Aborted { .. }
        )
    }

    pub(crate) fn usage_unavailable(tunnel_id: &str, reason: UsageUnavailableReason) -> Self {
        TunnelError::UsageUnavailable {
            tunnel_id: tunnel_id.to_string(),
            reason,
        }
    }
}
