//! [`ClusterApi`] over a `kube` client.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{ClusterApi, ClusterError, ListPage, PageRequest, WatchEvent, WatchStream};
use crate::labels::Selector;

/// Cluster access through the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster config or the local kubeconfig.
    ///
    /// # Errors
    ///
    /// Returns `Transport` when no usable configuration is found.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn all<K>(&self) -> Api<K>
    where
        K: Resource,
        <K as Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }
}

impl Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster").finish_non_exhaustive()
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => match response.code {
                404 => Self::not_found(response.message),
                409 if response.reason == "AlreadyExists" => Self::already_exists(response.message),
                409 => Self::conflict(response.message),
                code => Self::api(code, response.message),
            },
            other => Self::transport(other.to_string()),
        }
    }
}

fn object_name<K: Resource>(object: &K) -> Result<&str, ClusterError> {
    object
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| ClusterError::invalid_object("metadata.name is required"))
}

fn object_namespace<K: Resource>(object: &K) -> Result<&str, ClusterError> {
    object
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| ClusterError::invalid_object("metadata.namespace is required"))
}

async fn server_side_apply<K>(api: &Api<K>, object: &K, field_manager: &str) -> Result<K, ClusterError>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let name = object_name(object)?;
    let params = PatchParams::apply(field_manager).force();
    let applied = api.patch(name, &params, &Patch::Apply(object)).await?;
    debug!(name, field_manager, "applied server-side");
    Ok(applied)
}

async fn delete_named<K>(api: &Api<K>, name: &str) -> Result<(), ClusterError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.delete(name, &DeleteParams::background()).await?;
    Ok(())
}

async fn list_page<K>(
    api: &Api<K>,
    selector: &Selector,
    page: PageRequest,
) -> Result<ListPage<K>, ClusterError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut params = ListParams::default()
        .labels(&selector.to_string())
        .limit(page.limit);
    if let Some(token) = page.continue_token {
        params = params.continue_token(&token);
    }
    let list = api.list(&params).await?;
    Ok(ListPage {
        continue_token: list.metadata.continue_.filter(|token| !token.is_empty()),
        items: list.items,
    })
}

/// Errors are still yielded, but the next relist waits out an exponential
/// backoff.
fn watch_stream<K>(api: Api<K>, selector: &Selector) -> WatchStream<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let config = watcher::Config::default().labels(&selector.to_string());
    watcher(api, config)
        .default_backoff()
        .filter_map(|event| async move {
            match event {
                Ok(watcher::Event::Apply(object) | watcher::Event::InitApply(object)) => {
                    Some(Ok(WatchEvent::Applied(object)))
                }
                Ok(watcher::Event::Delete(object)) => Some(Ok(WatchEvent::Deleted(object))),
                Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                Err(err) => Some(Err(ClusterError::watch(err.to_string()))),
            }
        })
        .boxed()
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), ClusterError> {
        let api: Api<Namespace> = self.all();
        api.create(&PostParams::default(), namespace).await?;
        Ok(())
    }

    async fn apply_network_policy(
        &self,
        policy: &NetworkPolicy,
        field_manager: &str,
    ) -> Result<NetworkPolicy, ClusterError> {
        let api = self.namespaced(object_namespace(policy)?);
        server_side_apply(&api, policy, field_manager).await
    }

    async fn apply_replica_set(
        &self,
        replica_set: &ReplicaSet,
        field_manager: &str,
    ) -> Result<ReplicaSet, ClusterError> {
        let api = self.namespaced(object_namespace(replica_set)?);
        server_side_apply(&api, replica_set, field_manager).await
    }

    async fn apply_deployment(
        &self,
        deployment: &Deployment,
        field_manager: &str,
    ) -> Result<Deployment, ClusterError> {
        let api = self.namespaced(object_namespace(deployment)?);
        server_side_apply(&api, deployment, field_manager).await
    }

    async fn apply_service(
        &self,
        service: &Service,
        field_manager: &str,
    ) -> Result<Service, ClusterError> {
        let api = self.namespaced(object_namespace(service)?);
        server_side_apply(&api, service, field_manager).await
    }

    async fn delete_replica_set(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        delete_named(&self.namespaced::<ReplicaSet>(namespace), name).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        delete_named(&self.namespaced::<Deployment>(namespace), name).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        delete_named(&self.namespaced::<Service>(namespace), name).await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Pod>, ClusterError> {
        let params = ListParams::default().labels(&selector.to_string());
        let pods = self.namespaced::<Pod>(namespace).list(&params).await?;
        Ok(pods.items)
    }

    async fn list_replica_sets(
        &self,
        selector: &Selector,
        page: PageRequest,
    ) -> Result<ListPage<ReplicaSet>, ClusterError> {
        list_page(&self.all(), selector, page).await
    }

    async fn list_deployments(
        &self,
        selector: &Selector,
        page: PageRequest,
    ) -> Result<ListPage<Deployment>, ClusterError> {
        list_page(&self.all(), selector, page).await
    }

    async fn watch_replica_sets(
        &self,
        selector: &Selector,
    ) -> Result<WatchStream<ReplicaSet>, ClusterError> {
        Ok(watch_stream(self.all(), selector))
    }

    async fn watch_deployments(
        &self,
        selector: &Selector,
    ) -> Result<WatchStream<Deployment>, ClusterError> {
        Ok(watch_stream(self.all(), selector))
    }
}
