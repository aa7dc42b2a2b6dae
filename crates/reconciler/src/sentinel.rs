//! Sentinels: a `Deployment` fronted by a `ClusterIP` `Service`.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::Resource;
use tracing::{debug, info};

use crate::cluster::ignore_not_found;
use crate::deployment::{env_var, resource_requirements};
use crate::error::{Error, Result};
use crate::labels::{self, Component, Selector};
use crate::namespace::{self, Tenant, match_labels};
use crate::reconciler::Core;
use crate::status;
use crate::types::{ApplySentinel, DeleteSentinel, SentinelStateReport};
use crate::validation;

/// Port sentinels listen and are exposed on.
pub const SENTINEL_PORT: i32 = 8040;

const CONTAINER_NAME: &str = "sentinel";

pub(crate) fn pod_selector(manager: &str, sentinel_id: &str) -> Selector {
    Selector::managed(manager, Component::Sentinel).with(labels::SENTINEL_ID, sentinel_id)
}

fn object_labels(request: &ApplySentinel, manager: &str) -> Selector {
    pod_selector(manager, &request.sentinel_id)
        .with(labels::WORKSPACE_ID, &request.workspace_id)
        .with(labels::PROJECT_ID, &request.project_id)
        .with(labels::ENVIRONMENT_ID, &request.environment_id)
}

/// Build the `Deployment` running `request`.
#[must_use]
pub fn build_deployment(request: &ApplySentinel, manager: &str) -> Deployment {
    let labels = object_labels(request, manager).into_map();

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(request.image.clone()),
        ports: Some(vec![ContainerPort {
            container_port: SENTINEL_PORT,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }]),
        env: Some(vec![
            env_var("MOOR_SENTINEL_ID", &request.sentinel_id),
            env_var("MOOR_ENVIRONMENT_ID", &request.environment_id),
            env_var("MOOR_WORKSPACE_ID", &request.workspace_id),
            env_var("PORT", SENTINEL_PORT.to_string()),
        ]),
        resources: Some(resource_requirements(
            request.cpu_millicores,
            request.memory_mib,
        )),
        ..Container::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(request.k8s_name.clone()),
            namespace: Some(request.k8s_namespace.clone()),
            labels: Some(labels.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(request.replicas),
            selector: match_labels(pod_selector(manager, &request.sentinel_id)),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

/// Owner reference tying an object's lifetime to `owner`. `None` until the
/// owner has been persisted and carries a uid.
fn owner_reference(owner: &Deployment) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: Deployment::API_VERSION.to_string(),
        kind: Deployment::KIND.to_string(),
        name: owner.metadata.name.clone()?,
        uid: owner.metadata.uid.clone()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Build the `Service` exposing `request`, owned by `owner` when known.
#[must_use]
pub fn build_service(request: &ApplySentinel, manager: &str, owner: Option<&Deployment>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(request.k8s_name.clone()),
            namespace: Some(request.k8s_namespace.clone()),
            labels: Some(object_labels(request, manager).into_map()),
            owner_references: owner.and_then(owner_reference).map(|owner| vec![owner]),
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(pod_selector(manager, &request.sentinel_id).into_map()),
            ports: Some(vec![ServicePort {
                port: SENTINEL_PORT,
                target_port: Some(IntOrString::Int(SENTINEL_PORT)),
                protocol: Some("TCP".to_string()),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// Converge the cluster onto `request` and report availability.
pub(crate) async fn apply(core: &Core, request: &ApplySentinel) -> Result<()> {
    validation::apply_sentinel(request)?;

    let tenant = Tenant {
        workspace_id: &request.workspace_id,
        environment_id: &request.environment_id,
    };
    namespace::ensure(core, &request.k8s_namespace, Some(tenant)).await?;

    let manager = core.config.field_manager.as_str();
    let applied = core
        .cluster
        .apply_deployment(&build_deployment(request, manager), manager)
        .await
        .map_err(|err| Error::cluster("apply deployment", err))?;

    let service = build_service(request, manager, Some(&applied));
    core.cluster
        .apply_service(&service, manager)
        .await
        .map_err(|err| Error::cluster("apply service", err))?;
    info!(
        sentinel_id = %request.sentinel_id,
        namespace = %request.k8s_namespace,
        name = %request.k8s_name,
        replicas = request.replicas,
        "applied sentinel"
    );

    status::report_sentinel(core, &applied).await
}

/// Remove the sentinel's service and deployment, each independently, and
/// report it gone.
pub(crate) async fn delete(core: &Core, request: &DeleteSentinel) -> Result<()> {
    validation::delete_sentinel(request)?;

    let namespace = request.k8s_namespace.as_str();
    let name = request.k8s_name.as_str();
    let service = ignore_not_found(core.cluster.delete_service(namespace, name).await)
        .map_err(|err| Error::cluster("delete service", err));
    let deployment = ignore_not_found(core.cluster.delete_deployment(namespace, name).await)
        .map_err(|err| Error::cluster("delete deployment", err));
    service.and(deployment)?;
    debug!(namespace, name, "deleted sentinel");

    status::send_sentinel_report(
        core,
        SentinelStateReport::Delete {
            k8s_name: request.k8s_name.clone(),
        },
    )
    .await
}
