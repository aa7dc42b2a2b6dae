//! Observed state: pods to instances, and reports pushed upstream.
//!
//! Reports are always a fresh snapshot computed from the cluster, never a
//! delta, so concurrent reporters racing on the same object stay correct.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::debug;

use crate::deployment::WORKLOAD_PORT;
use crate::error::{Error, Result};
use crate::labels::Selector;
use crate::reconciler::Core;
use crate::types::{DeploymentStateReport, Instance, InstanceStatus, SentinelStateReport};

const READINESS_CONDITIONS: &[&str] = &["Ready", "ContainersReady"];

/// Cluster-local DNS name of a pod: `10-0-0-1.ns.pod.cluster.local`.
#[must_use]
pub fn pod_dns_name(ip: &str, namespace: &str) -> String {
    format!("{}.{namespace}.pod.cluster.local", ip.replace('.', "-"))
}

/// Routable `host:port` address of a pod.
#[must_use]
pub fn instance_address(ip: &str, namespace: &str, port: i32) -> String {
    format!("{}:{port}", pod_dns_name(ip, namespace))
}

/// Map a pod's phase and readiness onto an instance status.
#[must_use]
pub fn instance_status(pod: &Pod) -> InstanceStatus {
    let Some(status) = pod.status.as_ref() else {
        return InstanceStatus::Unspecified;
    };
    match status.phase.as_deref() {
        Some("Pending") => InstanceStatus::Pending,
        Some("Running") => {
            let ready = status
                .conditions
                .iter()
                .flatten()
                .filter(|condition| READINESS_CONDITIONS.contains(&condition.type_.as_str()))
                .all(|condition| condition.status == "True");
            if ready {
                InstanceStatus::Running
            } else {
                InstanceStatus::Failed
            }
        }
        Some("Failed") => InstanceStatus::Failed,
        _ => InstanceStatus::Unspecified,
    }
}

/// CPU quantity in millicores: `250m`, `1`, `0.5`.
#[allow(clippy::cast_possible_truncation)]
fn parse_millicores(quantity: &Quantity) -> Option<i64> {
    let raw = quantity.0.trim();
    if let Some(millis) = raw.strip_suffix('m') {
        return millis.parse().ok();
    }
    let cores: f64 = raw.parse().ok()?;
    Some((cores * 1000.0).round() as i64)
}

/// Memory quantity in MiB: `128Mi`, `1Gi`, `512M`, or plain bytes.
#[allow(clippy::cast_possible_truncation)]
fn parse_mebibytes(quantity: &Quantity) -> Option<i64> {
    const MIB: f64 = 1024.0 * 1024.0;
    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", MIB),
        ("Gi", MIB * 1024.0),
        ("Ti", MIB * 1024.0 * 1024.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];

    let raw = quantity.0.trim();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, multiplier)| raw.strip_suffix(suffix).map(|n| (n, *multiplier)))
        .unwrap_or((raw, 1.0));
    let value: f64 = number.parse().ok()?;
    Some((value * multiplier / MIB).round() as i64)
}

/// Summed container limits as `(millicores, MiB)`; zero when unset.
fn resource_limits(pod: &Pod) -> (i64, i64) {
    let containers = pod.spec.iter().flat_map(|spec| spec.containers.iter());
    containers
        .filter_map(|container| container.resources.as_ref()?.limits.as_ref())
        .fold((0, 0), |(cpu, memory), limits: &BTreeMap<String, Quantity>| {
            (
                cpu + limits.get("cpu").and_then(parse_millicores).unwrap_or(0),
                memory + limits.get("memory").and_then(parse_mebibytes).unwrap_or(0),
            )
        })
}

/// Instance record for a pod, or `None` while it has no IP.
#[must_use]
pub fn instance_for_pod(pod: &Pod, port: i32) -> Option<Instance> {
    let ip = pod
        .status
        .as_ref()?
        .pod_ip
        .as_deref()
        .filter(|ip| !ip.is_empty())?;
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let (cpu_millicores, memory_mib) = resource_limits(pod);

    Some(Instance {
        k8s_name: pod.metadata.name.clone().unwrap_or_default(),
        address: instance_address(ip, namespace, port),
        cpu_millicores,
        memory_mib,
        status: instance_status(pod),
    })
}

/// Current instances of a replica set.
pub(crate) async fn replica_set_instances(core: &Core, replica_set: &ReplicaSet) -> Result<Vec<Instance>> {
    let namespace = replica_set.metadata.namespace.as_deref().unwrap_or("default");
    let selector = replica_set
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.match_labels.clone())
        .map_or_else(Selector::new, Selector::from);
    if selector.as_map().is_empty() {
        return Ok(Vec::new());
    }

    let pods = core
        .cluster
        .list_pods(namespace, &selector)
        .await
        .map_err(|err| Error::cluster("list pods", err))?;
    Ok(pods
        .iter()
        .filter_map(|pod| instance_for_pod(pod, WORKLOAD_PORT))
        .collect())
}

/// Compute and push the state of a deployment's replica set.
pub(crate) async fn report_replica_set(core: &Core, replica_set: &ReplicaSet) -> Result<()> {
    let instances = replica_set_instances(core, replica_set).await?;
    let report = DeploymentStateReport::Update {
        k8s_name: replica_set.metadata.name.clone().unwrap_or_default(),
        instances,
    };
    send_deployment_report(core, report).await
}

/// Push the state of a sentinel deployment.
pub(crate) async fn report_sentinel(core: &Core, deployment: &Deployment) -> Result<()> {
    let available_replicas = deployment
        .status
        .as_ref()
        .and_then(|status| status.available_replicas)
        .unwrap_or(0);
    let report = SentinelStateReport::Update {
        k8s_name: deployment.metadata.name.clone().unwrap_or_default(),
        available_replicas,
    };
    send_sentinel_report(core, report).await
}

pub(crate) async fn send_deployment_report(core: &Core, report: DeploymentStateReport) -> Result<()> {
    debug!(name = %report.k8s_name(), "reporting deployment state");
    let control_plane = &core.control_plane;
    core.breaker
        .call(|| control_plane.update_deployment_state(report))
        .await?;
    Ok(())
}

pub(crate) async fn send_sentinel_report(core: &Core, report: SentinelStateReport) -> Result<()> {
    debug!(
        name = %report.k8s_name(),
        available_replicas = report.available_replicas(),
        "reporting sentinel state"
    );
    let control_plane = &core.control_plane;
    core.breaker
        .call(|| control_plane.update_sentinel_state(report))
        .await?;
    Ok(())
}
