//! Error types for the deployment orchestrator.
//!
//! `DeployError` is what components and the pipeline surface to callers.
//! `ProviderError` is what the boundary collaborators (control plane, identity
//! broker, object store, cache distribution) return.

use std::time::Duration;

/// Error returned by a boundary collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The caller's identity is not allowed to perform the request.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The request reached the provider and was rejected.
    #[error("request rejected: {0}")]
    Request(String),

    /// The request did not complete (transport failure, throttling, 5xx).
    #[error("transient failure: {0}")]
    Transient(String),
}

impl ProviderError {
    /// Whether retrying the same request might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Error raised while deploying or removing a target.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// A wait loop exceeded its attempt bound without observing a terminal state.
    #[error("timed out waiting for {what} after {attempts} attempts ({elapsed:?})")]
    PollTimeout {
        what: String,
        attempts: u32,
        elapsed: Duration,
    },

    /// A stack operation reached an explicit failure status.
    #[error("stack {stack} failed: {reason}")]
    ControlPlane { stack: String, reason: String },

    /// Credential exchange was rejected. Never retried.
    #[error("authorization rejected: {0}")]
    Authorization(String),

    /// A required stack output or local input is missing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An object upload, delete or listing failed during asset sync.
    #[error("asset sync failed: {0}")]
    Sync(String),

    /// A boundary collaborator call failed outside the cases above.
    #[error("remote call failed: {0}")]
    Remote(#[from] ProviderError),

    /// The run was interrupted.
    #[error("operation cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Whether this error is the attempt bound of a wait loop.
    pub fn is_poll_timeout(&self) -> bool {
        matches!(self, DeployError::PollTimeout { .. })
    }

    /// Short class name used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::PollTimeout { .. } => "TransientPollTimeout",
            DeployError::ControlPlane { .. } => "ControlPlaneFailure",
            DeployError::Authorization(_) => "AuthorizationError",
            DeployError::Configuration(_) => "ConfigurationError",
            DeployError::Sync(_) => "SyncFailure",
            DeployError::Remote(_) => "RemoteError",
            DeployError::Cancelled => "Cancelled",
            DeployError::Io(_) => "IoError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeployError::ControlPlane {
            stack: "site-dev".to_string(),
            reason: "Bucket already exists".to_string(),
        };
        assert_eq!(err.to_string(), "stack site-dev failed: Bucket already exists");

        let err = DeployError::PollTimeout {
            what: "stack site-dev".to_string(),
            attempts: 3,
            elapsed: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("after 3 attempts"));

        let err: DeployError = ProviderError::Request("bad template".to_string()).into();
        assert_eq!(err.to_string(), "remote call failed: request rejected: bad template");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            DeployError::Authorization("nope".into()).kind(),
            "AuthorizationError"
        );
        assert_eq!(DeployError::Sync("x".into()).kind(), "SyncFailure");
        assert!(
            DeployError::PollTimeout {
                what: "x".into(),
                attempts: 1,
                elapsed: Duration::ZERO
            }
            .is_poll_timeout()
        );
        assert!(!DeployError::Cancelled.is_poll_timeout());
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Transient("503".into()).is_transient());
        assert!(!ProviderError::AccessDenied("role".into()).is_transient());
        assert!(!ProviderError::Request("bad".into()).is_transient());
    }
}
