//! DECS controller error types

use crate::orchestrator::ProvisioningOutcome;
use thiserror::Error;

/// Why an authentication attempt did not produce a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// A field required by the authentication mode is empty
    MissingCredential,
    /// The control plane (or the OAuth2 provider) refused the credential
    Rejected,
    /// The authentication request never got an answer
    NetworkFailure,
    /// An operation that needs one authentication mode was invoked under another
    ModeMismatch,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthFailure::MissingCredential => write!(f, "missing credential"),
            AuthFailure::Rejected => write!(f, "rejected"),
            AuthFailure::NetworkFailure => write!(f, "network failure"),
            AuthFailure::ModeMismatch => write!(f, "mode mismatch"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DecsError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Authentication failed ({reason}): {message}")]
    Auth { reason: AuthFailure, message: String },

    #[error("Transient failure calling {endpoint} after {attempts} attempt(s): {message}")]
    Transient {
        endpoint: String,
        attempts: u32,
        message: String,
    },

    #[error("API error on {endpoint} (HTTP {status}): {body}")]
    Api {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cannot decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error(
        "Machine {} provisioned partially; pending: {}",
        outcome.assigned_id.unwrap_or_default(),
        outcome.pending_groups().join(", ")
    )]
    PartialProvisioning { outcome: Box<ProvisioningOutcome> },

    #[error("Cloud error: {0}")]
    Cloud(#[from] decs_cloud::CloudError),
}

impl DecsError {
    pub fn auth(reason: AuthFailure, message: impl Into<String>) -> Self {
        DecsError::Auth {
            reason,
            message: message.into(),
        }
    }

    /// The control plane reported the object as absent
    pub fn is_not_found(&self) -> bool {
        match self {
            DecsError::NotFound(_) => true,
            DecsError::Api { status, .. } => *status == 404,
            _ => false,
        }
    }

    /// Worth re-invoking on the next reconciliation pass without changing anything
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DecsError::Transient { .. }
                | DecsError::Auth {
                    reason: AuthFailure::NetworkFailure,
                    ..
                }
        )
    }

    /// Authentication failure reason, if this is an authentication error
    pub fn auth_reason(&self) -> Option<AuthFailure> {
        match self {
            DecsError::Auth { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DecsError>;
