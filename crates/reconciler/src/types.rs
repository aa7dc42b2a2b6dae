//! Desired-state records and status reports exchanged with the control plane.

use serde::{Deserialize, Serialize};

/// One sequenced record on the sync stream.
///
/// `kind` is optional on the wire; a record without a payload is rejected
/// by [`crate::Reconciler::handle_state`] with `UnknownStateType`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Monotonic version assigned by the control plane.
    pub sequence: u64,
    /// Record payload.
    pub kind: Option<StateKind>,
}

impl State {
    /// Create a record carrying a deployment payload.
    pub fn deployment(sequence: u64, state: DeploymentState) -> Self {
        Self {
            sequence,
            kind: Some(StateKind::Deployment(state)),
        }
    }

    /// Create a record carrying a sentinel payload.
    pub fn sentinel(sequence: u64, state: SentinelState) -> Self {
        Self {
            sequence,
            kind: Some(StateKind::Sentinel(state)),
        }
    }

    /// Create a bookmark record announcing `bookmark` as a resume point.
    pub fn bookmark(sequence: u64, bookmark: u64) -> Self {
        Self {
            sequence,
            kind: Some(StateKind::Bookmark(Bookmark { sequence: bookmark })),
        }
    }
}

/// Record payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Deployment(DeploymentState),
    Sentinel(SentinelState),
    Bookmark(Bookmark),
}

/// Marker carrying a resume point; no cluster effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub sequence: u64,
}

/// Desired state of a customer deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Apply(ApplyDeployment),
    Delete(DeleteDeployment),
}

/// Desired state of a sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentinelState {
    Apply(ApplySentinel),
    Delete(DeleteSentinel),
}

/// Full desired configuration of one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyDeployment {
    pub workspace_id: String,
    pub project_id: String,
    pub environment_id: String,
    pub deployment_id: String,
    pub k8s_namespace: String,
    pub k8s_name: String,
    pub image: String,
    pub replicas: i32,
    pub cpu_millicores: i64,
    pub memory_mib: i64,
    #[serde(default)]
    pub build_id: Option<String>,
    /// Overrides the image entrypoint when present.
    #[serde(default)]
    pub command: Vec<String>,
    /// Opaque blob injected base64-encoded into the workload environment.
    #[serde(default)]
    pub encrypted_environment_variables: Option<Vec<u8>>,
    #[serde(default)]
    pub healthcheck: Option<Healthcheck>,
    /// Signal name sent to the workload on shutdown, e.g. `SIGINT`.
    #[serde(default)]
    pub shutdown_signal: Option<String>,
}

/// HTTP health check translated into liveness and readiness probes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Healthcheck {
    pub path: String,
    #[serde(default)]
    pub port: Option<i32>,
    pub interval_secs: i32,
    pub timeout_secs: i32,
    pub failure_threshold: i32,
    #[serde(default)]
    pub initial_delay_secs: i32,
}

/// Removal request for a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteDeployment {
    pub k8s_namespace: String,
    pub k8s_name: String,
}

/// Full desired configuration of one sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySentinel {
    pub workspace_id: String,
    pub project_id: String,
    pub environment_id: String,
    pub sentinel_id: String,
    pub k8s_namespace: String,
    pub k8s_name: String,
    pub image: String,
    pub replicas: i32,
    pub cpu_millicores: i64,
    pub memory_mib: i64,
}

/// Removal request for a sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSentinel {
    pub k8s_namespace: String,
    pub k8s_name: String,
}

/// Lifecycle of a single deployment instance as reported upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Unspecified,
    Pending,
    Running,
    Failed,
}

/// One running instance of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Pod name.
    pub k8s_name: String,
    /// Cluster-internal address, `host:port`.
    pub address: String,
    pub cpu_millicores: i64,
    pub memory_mib: i64,
    pub status: InstanceStatus,
}

/// Observed deployment state pushed to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStateReport {
    Update {
        k8s_name: String,
        instances: Vec<Instance>,
    },
    Delete {
        k8s_name: String,
    },
}

impl DeploymentStateReport {
    /// Name of the workload this report describes.
    #[must_use]
    pub fn k8s_name(&self) -> &str {
        match self {
            Self::Update { k8s_name, .. } | Self::Delete { k8s_name } => k8s_name,
        }
    }
}

/// Observed sentinel state pushed to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentinelStateReport {
    Update {
        k8s_name: String,
        available_replicas: i32,
    },
    Delete {
        k8s_name: String,
    },
}

impl SentinelStateReport {
    /// Name of the sentinel this report describes.
    #[must_use]
    pub fn k8s_name(&self) -> &str {
        match self {
            Self::Update { k8s_name, .. } | Self::Delete { k8s_name } => k8s_name,
        }
    }

    /// Replicas able to serve traffic; a deleted sentinel has none.
    #[must_use]
    pub const fn available_replicas(&self) -> i32 {
        match self {
            Self::Update {
                available_replicas, ..
            } => *available_replicas,
            Self::Delete { .. } => 0,
        }
    }
}
