//! Customer deployments, run as one `ReplicaSet` per deployment.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, EnvVar, ExecAction, HTTPGetAction, Lifecycle,
    LifecycleHandler, PodAffinity, PodAffinityTerm, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Toleration, TopologySpreadConstraint, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{debug, info};

use crate::cluster::ignore_not_found;
use crate::error::{Error, Result};
use crate::labels::{self, Component, Selector};
use crate::namespace::{self, Tenant, match_labels};
use crate::reconciler::Core;
use crate::status;
use crate::types::{ApplyDeployment, DeleteDeployment, DeploymentStateReport, Healthcheck};
use crate::validation;

/// Port every workload container listens on.
pub const WORKLOAD_PORT: i32 = 8080;

const CONTAINER_NAME: &str = "workload";
const RUNTIME_CLASS: &str = "gvisor";
const UNTRUSTED_TAINT: &str = "moor.dev/untrusted";
const ZONE_TOPOLOGY_KEY: &str = "topology.kubernetes.io/zone";
const TERMINATION_GRACE_PERIOD_SECS: i64 = 30;
const SENTINEL_AFFINITY_WEIGHT: i32 = 100;
const DEFAULT_SIGNAL: &str = "SIGTERM";

/// Labels selecting a deployment's pods. Stable across applies since a
/// `ReplicaSet` selector is immutable.
pub(crate) fn pod_selector(manager: &str, deployment_id: &str) -> Selector {
    Selector::managed(manager, Component::Deployment).with(labels::DEPLOYMENT_ID, deployment_id)
}

fn object_labels(request: &ApplyDeployment, manager: &str) -> Selector {
    let labels = pod_selector(manager, &request.deployment_id)
        .with(labels::WORKSPACE_ID, &request.workspace_id)
        .with(labels::PROJECT_ID, &request.project_id)
        .with(labels::ENVIRONMENT_ID, &request.environment_id);
    match &request.build_id {
        Some(build_id) => labels.with(labels::BUILD_ID, build_id),
        None => labels,
    }
}

/// Identical requests and limits for `cpu_millicores` and `memory_mib`.
pub(crate) fn resource_requirements(cpu_millicores: i64, memory_mib: i64) -> ResourceRequirements {
    let quantities = BTreeMap::from([
        ("cpu".to_string(), Quantity(format!("{cpu_millicores}m"))),
        ("memory".to_string(), Quantity(format!("{memory_mib}Mi"))),
    ]);
    ResourceRequirements {
        limits: Some(quantities.clone()),
        requests: Some(quantities),
        ..ResourceRequirements::default()
    }
}

pub(crate) fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..EnvVar::default()
    }
}

fn environment(request: &ApplyDeployment) -> Vec<EnvVar> {
    let mut env = vec![
        env_var("MOOR_WORKSPACE_ID", &request.workspace_id),
        env_var("MOOR_PROJECT_ID", &request.project_id),
        env_var("MOOR_ENVIRONMENT_ID", &request.environment_id),
        env_var("MOOR_DEPLOYMENT_ID", &request.deployment_id),
        env_var("PORT", WORKLOAD_PORT.to_string()),
    ];
    if let Some(blob) = &request.encrypted_environment_variables {
        env.push(env_var("MOOR_ENCRYPTED_ENV", STANDARD.encode(blob)));
    }
    env
}

fn probe(check: &Healthcheck) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(check.path.clone()),
            port: IntOrString::Int(check.port.unwrap_or(WORKLOAD_PORT)),
            ..HTTPGetAction::default()
        }),
        period_seconds: Some(check.interval_secs),
        timeout_seconds: Some(check.timeout_secs),
        failure_threshold: Some(check.failure_threshold),
        initial_delay_seconds: Some(check.initial_delay_secs),
        ..Probe::default()
    }
}

/// The kubelet always sends SIGTERM; any other signal is delivered by a
/// pre-stop hook first.
fn pre_stop(signal: Option<&str>) -> Option<Lifecycle> {
    let signal = signal.filter(|signal| *signal != DEFAULT_SIGNAL)?;
    let name = signal.trim_start_matches("SIG");
    Some(Lifecycle {
        pre_stop: Some(LifecycleHandler {
            exec: Some(ExecAction {
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    format!("kill -{name} 1"),
                ]),
            }),
            ..LifecycleHandler::default()
        }),
        ..Lifecycle::default()
    })
}

fn affinity(request: &ApplyDeployment, manager: &str, sentinel_namespace: &str) -> Affinity {
    let sentinels = Selector::managed(manager, Component::Sentinel)
        .with(labels::ENVIRONMENT_ID, &request.environment_id);
    Affinity {
        pod_affinity: Some(PodAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: SENTINEL_AFFINITY_WEIGHT,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(match_labels(sentinels)),
                        namespaces: Some(vec![sentinel_namespace.to_string()]),
                        topology_key: ZONE_TOPOLOGY_KEY.to_string(),
                        ..PodAffinityTerm::default()
                    },
                },
            ]),
            ..PodAffinity::default()
        }),
        ..Affinity::default()
    }
}

/// Build the `ReplicaSet` running `request`.
#[must_use]
pub fn build_replica_set(
    request: &ApplyDeployment,
    manager: &str,
    sentinel_namespace: &str,
) -> ReplicaSet {
    let labels = object_labels(request, manager).into_map();
    let selector = pod_selector(manager, &request.deployment_id);

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(request.image.clone()),
        command: (!request.command.is_empty()).then(|| request.command.clone()),
        ports: Some(vec![ContainerPort {
            container_port: WORKLOAD_PORT,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }]),
        env: Some(environment(request)),
        resources: Some(resource_requirements(
            request.cpu_millicores,
            request.memory_mib,
        )),
        liveness_probe: request.healthcheck.as_ref().map(probe),
        readiness_probe: request.healthcheck.as_ref().map(probe),
        lifecycle: pre_stop(request.shutdown_signal.as_deref()),
        ..Container::default()
    };

    let pod = PodSpec {
        containers: vec![container],
        runtime_class_name: Some(RUNTIME_CLASS.to_string()),
        automount_service_account_token: Some(false),
        termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECS),
        tolerations: Some(vec![Toleration {
            key: Some(UNTRUSTED_TAINT.to_string()),
            operator: Some("Equal".to_string()),
            value: Some("true".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Toleration::default()
        }]),
        topology_spread_constraints: Some(vec![TopologySpreadConstraint {
            max_skew: 1,
            topology_key: ZONE_TOPOLOGY_KEY.to_string(),
            when_unsatisfiable: "ScheduleAnyway".to_string(),
            label_selector: Some(match_labels(selector.clone())),
            ..TopologySpreadConstraint::default()
        }]),
        affinity: Some(affinity(request, manager, sentinel_namespace)),
        ..PodSpec::default()
    };

    ReplicaSet {
        metadata: ObjectMeta {
            name: Some(request.k8s_name.clone()),
            namespace: Some(request.k8s_namespace.clone()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(ReplicaSetSpec {
            replicas: Some(request.replicas),
            selector: match_labels(selector),
            template: Some(PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(pod),
            }),
            ..ReplicaSetSpec::default()
        }),
        ..ReplicaSet::default()
    }
}

/// Converge the cluster onto `request` and report the resulting instances.
pub(crate) async fn apply(core: &Core, request: &ApplyDeployment) -> Result<()> {
    validation::apply_deployment(request)?;

    let tenant = Tenant {
        workspace_id: &request.workspace_id,
        environment_id: &request.environment_id,
    };
    namespace::ensure(core, &request.k8s_namespace, Some(tenant)).await?;

    let manager = core.config.field_manager.as_str();
    let desired = build_replica_set(request, manager, &core.config.sentinel_namespace);
    let applied = core
        .cluster
        .apply_replica_set(&desired, manager)
        .await
        .map_err(|err| Error::cluster("apply replica set", err))?;
    info!(
        deployment_id = %request.deployment_id,
        namespace = %request.k8s_namespace,
        name = %request.k8s_name,
        replicas = request.replicas,
        "applied deployment"
    );

    status::report_replica_set(core, &applied).await
}

/// Remove the deployment's `ReplicaSet` and report it gone.
pub(crate) async fn delete(core: &Core, request: &DeleteDeployment) -> Result<()> {
    validation::delete_deployment(request)?;

    ignore_not_found(
        core.cluster
            .delete_replica_set(&request.k8s_namespace, &request.k8s_name)
            .await,
    )
    .map_err(|err| Error::cluster("delete replica set", err))?;
    debug!(
        namespace = %request.k8s_namespace,
        name = %request.k8s_name,
        "deleted deployment"
    );

    status::send_deployment_report(
        core,
        DeploymentStateReport::Delete {
            k8s_name: request.k8s_name.clone(),
        },
    )
    .await
}
