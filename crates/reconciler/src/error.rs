//! Error types for the reconciler crate.

use moor_breaker::BreakerError;
use thiserror::Error;

use crate::cluster::ClusterError;
use crate::control_plane::ControlPlaneError;
use crate::validation::ValidationErrors;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reconciler error types.
#[derive(Debug, Error)]
pub enum Error {
    /// `handle_state` received no record.
    #[error("state is nil")]
    NilState,

    /// The record carries no recognised payload.
    #[error("unknown state type")]
    UnknownStateType,

    /// A desired-state payload failed validation.
    #[error("invalid desired state: {0}")]
    Validation(#[from] ValidationErrors),

    /// A cluster call failed.
    #[error("cluster {operation} failed: {source}")]
    Cluster {
        operation: String,
        #[source]
        source: ClusterError,
    },

    /// A control-plane call failed or was rejected by the circuit breaker.
    #[error("control plane: {0}")]
    ControlPlane(#[from] BreakerError<ControlPlaneError>),

    /// Reconciler configuration is unusable.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// `start` was called on a running reconciler.
    #[error("reconciler already started")]
    AlreadyStarted,

    /// `stop` was called before `start`.
    #[error("reconciler not started")]
    NotStarted,
}

impl Error {
    /// Create a cluster error for the named operation.
    pub fn cluster(operation: impl Into<String>, source: ClusterError) -> Self {
        Self::Cluster {
            operation: operation.into(),
            source,
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Whether the control plane call was short-circuited by the breaker.
    #[must_use]
    pub fn is_breaker_rejection(&self) -> bool {
        matches!(self, Self::ControlPlane(err) if err.is_rejected())
    }
}

impl From<ControlPlaneError> for Error {
    fn from(err: ControlPlaneError) -> Self {
        Self::ControlPlane(BreakerError::Inner(err))
    }
}

impl From<moor_core::Error> for Error {
    fn from(err: moor_core::Error) -> Self {
        Self::invalid_config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_errors_display() {
        assert_eq!(Error::NilState.to_string(), "state is nil");
        assert_eq!(Error::UnknownStateType.to_string(), "unknown state type");
    }

    #[test]
    fn test_cluster_error_names_operation() {
        let err = Error::cluster("apply replica set", ClusterError::conflict("field manager"));
        let msg = err.to_string();
        assert!(msg.contains("apply replica set"));
        assert!(msg.contains("field manager"));
    }

    #[test]
    fn test_breaker_rejection() {
        let tripped = Error::ControlPlane(BreakerError::Tripped {
            name: "control-plane".into(),
        });
        assert!(tripped.is_breaker_rejection());

        let inner = Error::from(ControlPlaneError::unavailable("connection refused"));
        assert!(!inner.is_breaker_rejection());
    }
}
