//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Container, Pod, PodCondition, PodSpec, PodStatus, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use moor::moor_reconciler::labels;
use moor::moor_reconciler::testing::{FakeControlPlane, InMemoryCluster};
use moor::moor_reconciler::{
    ApplyDeployment, ApplySentinel, DeleteDeployment, DeleteSentinel, DeploymentState,
    SentinelState, State,
};
use moor::{Reconciler, ReconcilerConfig};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Virtual-time budget for waiting on background loops.
pub const SETTLE: Duration = Duration::from_secs(30);

pub const NAMESPACE: &str = "env-1";
pub const SENTINEL_NAMESPACE: &str = "sentinel";

/// Object name of deployment `id`: `d_1` becomes `api-d-1`.
pub fn deployment_name(id: &str) -> String {
    format!("api-{}", id.replace('_', "-"))
}

/// Object name of sentinel `id`: `s_1` becomes `gw-s-1`.
pub fn sentinel_name(id: &str) -> String {
    format!("gw-{}", id.replace('_', "-"))
}

pub struct Harness {
    pub reconciler: Reconciler,
    pub cluster: Arc<InMemoryCluster>,
    pub control_plane: Arc<FakeControlPlane>,
}

pub fn config() -> ReconcilerConfig {
    let mut config = ReconcilerConfig {
        instance_id: "moor-test".into(),
        region: "eu-test-1".into(),
        ..ReconcilerConfig::default()
    };
    config.sync.min_backoff_ms = 10;
    config.sync.max_backoff_ms = 20;
    config
}

pub fn harness() -> Result<Harness, moor::Error> {
    harness_with(config())
}

pub fn harness_with(config: ReconcilerConfig) -> Result<Harness, moor::Error> {
    let cluster = Arc::new(InMemoryCluster::new());
    let control_plane = Arc::new(FakeControlPlane::new());
    let reconciler = Reconciler::builder()
        .with_config(config)
        .with_cluster(cluster.clone())
        .with_control_plane(control_plane.clone())
        .build()?;
    Ok(Harness {
        reconciler,
        cluster,
        control_plane,
    })
}

pub fn deployment(id: &str) -> ApplyDeployment {
    ApplyDeployment {
        workspace_id: "ws_1".into(),
        project_id: "proj_1".into(),
        environment_id: "env_1".into(),
        deployment_id: id.into(),
        k8s_namespace: NAMESPACE.into(),
        k8s_name: deployment_name(id),
        image: "registry.local/api:1".into(),
        replicas: 3,
        cpu_millicores: 100,
        memory_mib: 128,
        ..ApplyDeployment::default()
    }
}

pub fn sentinel(id: &str) -> ApplySentinel {
    ApplySentinel {
        workspace_id: "ws_1".into(),
        project_id: "proj_1".into(),
        environment_id: "env_1".into(),
        sentinel_id: id.into(),
        k8s_namespace: SENTINEL_NAMESPACE.into(),
        k8s_name: sentinel_name(id),
        image: "registry.local/sentinel:4".into(),
        replicas: 2,
        cpu_millicores: 500,
        memory_mib: 256,
    }
}

pub fn apply_deployment(sequence: u64, id: &str) -> State {
    State::deployment(sequence, DeploymentState::Apply(deployment(id)))
}

pub fn delete_deployment(sequence: u64, id: &str) -> State {
    State::deployment(
        sequence,
        DeploymentState::Delete(DeleteDeployment {
            k8s_namespace: NAMESPACE.into(),
            k8s_name: deployment_name(id),
        }),
    )
}

pub fn apply_sentinel(sequence: u64, id: &str) -> State {
    State::sentinel(sequence, SentinelState::Apply(sentinel(id)))
}

pub fn delete_sentinel(sequence: u64, id: &str) -> State {
    State::sentinel(
        sequence,
        SentinelState::Delete(DeleteSentinel {
            k8s_namespace: SENTINEL_NAMESPACE.into(),
            k8s_name: sentinel_name(id),
        }),
    )
}

/// A pod of deployment `id` as the replica set controller would create it.
pub fn workload_pod(id: &str, name: &str, phase: &str, ip: Option<&str>, ready: bool) -> Pod {
    let condition = |kind: &str| PodCondition {
        type_: kind.into(),
        status: if ready { "True" } else { "False" }.into(),
        ..PodCondition::default()
    };
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(NAMESPACE.into()),
            labels: Some(BTreeMap::from([
                (labels::MANAGED_BY.to_string(), "moor".to_string()),
                (labels::COMPONENT.to_string(), "deployment".to_string()),
                (labels::DEPLOYMENT_ID.to_string(), id.to_string()),
            ])),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "workload".into(),
                resources: Some(ResourceRequirements {
                    limits: Some(BTreeMap::from([
                        ("cpu".to_string(), Quantity("100m".into())),
                        ("memory".to_string(), Quantity("128Mi".into())),
                    ])),
                    ..ResourceRequirements::default()
                }),
                ..Container::default()
            }],
            ..PodSpec::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.into()),
            pod_ip: ip.map(Into::into),
            conditions: Some(vec![condition("Ready"), condition("ContainersReady")]),
            ..PodStatus::default()
        }),
    }
}
