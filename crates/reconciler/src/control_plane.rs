//! Control-plane client surface.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::types::{DeploymentStateReport, SentinelStateReport, State};

/// Errors returned by control-plane calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlPlaneError {
    #[error("control plane unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("not found: {reason}")]
    NotFound { reason: String },

    #[error("rpc failed with {code}: {message}")]
    Rpc { code: String, message: String },

    #[error("sync stream failed: {reason}")]
    Stream { reason: String },
}

impl ControlPlaneError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound {
            reason: reason.into(),
        }
    }

    pub fn rpc(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn stream(reason: impl Into<String>) -> Self {
        Self::Stream {
            reason: reason.into(),
        }
    }

    /// Whether the error counts against the circuit breaker. `NotFound`
    /// does not.
    #[must_use]
    pub const fn is_outage(&self) -> bool {
        !matches!(self, Self::NotFound { .. })
    }
}

/// Parameters opening a sync session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub region: String,
    /// Committed resume point; 0 requests a full bootstrap.
    pub sequence_last_seen: u64,
}

pub type StateStream = BoxStream<'static, Result<State, ControlPlaneError>>;

/// Calls the reconciler makes against the control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Open a sync session. The stream ends cleanly once the control plane
    /// has sent everything after `sequence_last_seen`.
    async fn sync(&self, request: SyncRequest) -> Result<StateStream, ControlPlaneError>;

    async fn get_desired_deployment_state(
        &self,
        deployment_id: &str,
    ) -> Result<State, ControlPlaneError>;

    async fn get_desired_sentinel_state(&self, sentinel_id: &str)
    -> Result<State, ControlPlaneError>;

    async fn update_deployment_state(
        &self,
        report: DeploymentStateReport,
    ) -> Result<(), ControlPlaneError>;

    async fn update_sentinel_state(
        &self,
        report: SentinelStateReport,
    ) -> Result<(), ControlPlaneError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_not_an_outage() {
        assert!(!ControlPlaneError::not_found("deployment d_1").is_outage());
        assert!(ControlPlaneError::unavailable("connection reset").is_outage());
        assert!(ControlPlaneError::rpc("internal", "boom").is_outage());
    }
}
