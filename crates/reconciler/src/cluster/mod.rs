//! Cluster access.
//!
//! [`ClusterApi`] is the narrow surface the reconciler needs from a
//! Kubernetes API server: server-side apply, delete, paged list and watch
//! for the handful of object kinds it manages. [`KubeCluster`] backs
//! it with a real client.

mod live;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use thiserror::Error;

use crate::labels::Selector;

pub use live::KubeCluster;

/// Errors returned by cluster calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("not found: {reason}")]
    NotFound { reason: String },

    #[error("already exists: {reason}")]
    AlreadyExists { reason: String },

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },

    #[error("object is invalid: {reason}")]
    InvalidObject { reason: String },

    #[error("watch failed: {reason}")]
    Watch { reason: String },

    #[error("transport error: {reason}")]
    Transport { reason: String },
}

impl ClusterError {
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound {
            reason: reason.into(),
        }
    }

    pub fn already_exists(reason: impl Into<String>) -> Self {
        Self::AlreadyExists {
            reason: reason.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    pub fn api(code: u16, message: impl Into<String>) -> Self {
        Self::Api {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_object(reason: impl Into<String>) -> Self {
        Self::InvalidObject {
            reason: reason.into(),
        }
    }

    pub fn watch(reason: impl Into<String>) -> Self {
        Self::Watch {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Continuation request for a paged list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: u32,
    pub continue_token: Option<String>,
}

impl PageRequest {
    #[must_use]
    pub const fn first(limit: u32) -> Self {
        Self {
            limit,
            continue_token: None,
        }
    }
}

/// One page of a list call.
#[derive(Debug, Clone, PartialEq)]
pub struct ListPage<K> {
    pub items: Vec<K>,
    /// Present while more pages remain.
    pub continue_token: Option<String>,
}

/// Change notification for a watched object.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    /// Object was added or modified.
    Applied(K),
    /// Object was removed.
    Deleted(K),
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, ClusterError>>;

/// Operations the reconciler performs against the cluster.
///
/// Apply calls are server-side apply under `field_manager` and force
/// ownership of conflicting fields. Deletes report `NotFound` as an error;
/// callers decide whether absence is acceptable.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a namespace; `AlreadyExists` when it is present.
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), ClusterError>;

    async fn apply_network_policy(
        &self,
        policy: &NetworkPolicy,
        field_manager: &str,
    ) -> Result<NetworkPolicy, ClusterError>;

    async fn apply_replica_set(
        &self,
        replica_set: &ReplicaSet,
        field_manager: &str,
    ) -> Result<ReplicaSet, ClusterError>;

    async fn apply_deployment(
        &self,
        deployment: &Deployment,
        field_manager: &str,
    ) -> Result<Deployment, ClusterError>;

    async fn apply_service(
        &self,
        service: &Service,
        field_manager: &str,
    ) -> Result<Service, ClusterError>;

    async fn delete_replica_set(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Pods in `namespace` matching `selector`.
    async fn list_pods(&self, namespace: &str, selector: &Selector)
    -> Result<Vec<Pod>, ClusterError>;

    /// Replica sets across all namespaces matching `selector`.
    async fn list_replica_sets(
        &self,
        selector: &Selector,
        page: PageRequest,
    ) -> Result<ListPage<ReplicaSet>, ClusterError>;

    /// Deployments across all namespaces matching `selector`.
    async fn list_deployments(
        &self,
        selector: &Selector,
        page: PageRequest,
    ) -> Result<ListPage<Deployment>, ClusterError>;

    /// Subscribe to changes of replica sets matching `selector`.
    async fn watch_replica_sets(
        &self,
        selector: &Selector,
    ) -> Result<WatchStream<ReplicaSet>, ClusterError>;

    /// Subscribe to changes of deployments matching `selector`.
    async fn watch_deployments(
        &self,
        selector: &Selector,
    ) -> Result<WatchStream<Deployment>, ClusterError>;
}

/// Map `NotFound` to success.
///
/// # Errors
///
/// Every other error is returned unchanged.
pub fn ignore_not_found(result: Result<(), ClusterError>) -> Result<(), ClusterError> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}
