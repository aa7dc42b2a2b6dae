//! Workload namespaces and their network isolation.

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use tracing::debug;

use crate::error::{Error, Result};
use crate::labels::{self, Component, Selector};
use crate::reconciler::Core;

/// Name of the policy placed in every workload namespace.
pub const ISOLATION_POLICY_NAME: &str = "moor-isolation";

const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

/// Tenant a workload namespace belongs to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tenant<'a> {
    pub workspace_id: &'a str,
    pub environment_id: &'a str,
}

pub(crate) fn build_namespace(name: &str, manager: &str, tenant: Option<Tenant<'_>>) -> Namespace {
    let mut labels = Selector::new().with(labels::MANAGED_BY, manager);
    if let Some(tenant) = tenant {
        labels = labels
            .with(labels::WORKSPACE_ID, tenant.workspace_id)
            .with(labels::ENVIRONMENT_ID, tenant.environment_id);
    }

    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.into_map()),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

/// Admit ingress to workload pods only from this tenant's sentinels.
pub(crate) fn build_isolation_policy(
    namespace: &str,
    manager: &str,
    sentinel_namespace: &str,
    tenant: Tenant<'_>,
) -> NetworkPolicy {
    let workloads = Selector::managed(manager, Component::Deployment);
    let sentinels = Selector::managed(manager, Component::Sentinel)
        .with(labels::WORKSPACE_ID, tenant.workspace_id)
        .with(labels::ENVIRONMENT_ID, tenant.environment_id);
    let sentinel_namespace = Selector::new().with(NAMESPACE_NAME_LABEL, sentinel_namespace);

    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(ISOLATION_POLICY_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(Selector::new().with(labels::MANAGED_BY, manager).into_map()),
            ..ObjectMeta::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: match_labels(workloads),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    namespace_selector: Some(match_labels(sentinel_namespace)),
                    pod_selector: Some(match_labels(sentinels)),
                    ..NetworkPolicyPeer::default()
                }]),
                ..NetworkPolicyIngressRule::default()
            }]),
            ..NetworkPolicySpec::default()
        }),
    }
}

pub(crate) fn match_labels(selector: Selector) -> LabelSelector {
    LabelSelector {
        match_labels: Some(selector.into_map()),
        ..LabelSelector::default()
    }
}

/// Create `namespace` if missing and, outside the sentinel namespace,
/// upsert its isolation policy.
pub(crate) async fn ensure(core: &Core, namespace: &str, tenant: Option<Tenant<'_>>) -> Result<()> {
    let manager = core.config.field_manager.as_str();
    let sentinel_namespace = core.config.sentinel_namespace.as_str();
    let is_sentinel_namespace = namespace == sentinel_namespace;

    let desired = build_namespace(namespace, manager, tenant.filter(|_| !is_sentinel_namespace));
    match core.cluster.create_namespace(&desired).await {
        Ok(()) => debug!(namespace, "created namespace"),
        Err(err) if err.is_already_exists() => {}
        Err(err) => return Err(Error::cluster("create namespace", err)),
    }

    if let (false, Some(tenant)) = (is_sentinel_namespace, tenant) {
        let policy = build_isolation_policy(namespace, manager, sentinel_namespace, tenant);
        core.cluster
            .apply_network_policy(&policy, manager)
            .await
            .map_err(|err| Error::cluster("apply network policy", err))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const TENANT: Tenant<'static> = Tenant {
        workspace_id: "ws_1",
        environment_id: "env_1",
    };

    #[test]
    fn test_namespace_carries_tenant_labels() {
        let ns = build_namespace("env-1", "moor", Some(TENANT));
        let labels = ns.metadata.labels.unwrap();
        assert_eq!(ns.metadata.name.as_deref(), Some("env-1"));
        assert_eq!(labels[labels::MANAGED_BY], "moor");
        assert_eq!(labels[labels::ENVIRONMENT_ID], "env_1");
    }

    #[test]
    fn test_isolation_policy_admits_only_tenant_sentinels() {
        let policy = build_isolation_policy("env-1", "moor", "sentinel", TENANT);
        let spec = policy.spec.unwrap();

        assert_eq!(policy.metadata.name.as_deref(), Some(ISOLATION_POLICY_NAME));
        assert_eq!(policy.metadata.namespace.as_deref(), Some("env-1"));
        assert_eq!(
            spec.pod_selector.match_labels.unwrap()[labels::COMPONENT],
            "deployment"
        );

        let ingress = spec.ingress.unwrap();
        assert_eq!(ingress.len(), 1);
        let peer = &ingress[0].from.as_ref().unwrap()[0];
        let pods = peer.pod_selector.as_ref().unwrap().match_labels.as_ref().unwrap();
        let namespaces = peer
            .namespace_selector
            .as_ref()
            .unwrap()
            .match_labels
            .as_ref()
            .unwrap();

        assert_eq!(pods[labels::COMPONENT], "sentinel");
        assert_eq!(pods[labels::WORKSPACE_ID], "ws_1");
        assert_eq!(pods[labels::ENVIRONMENT_ID], "env_1");
        assert_eq!(namespaces[NAMESPACE_NAME_LABEL], "sentinel");
    }
}
