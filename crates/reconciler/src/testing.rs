//! In-memory doubles for the cluster and the control plane.
//!
//! Enabled for unit tests and, for downstream crates, by the `test-utils`
//! feature.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus, ReplicaSet};
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::Resource;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::cluster::{ClusterApi, ClusterError, ListPage, PageRequest, WatchEvent, WatchStream};
use crate::control_plane::{ControlPlane, ControlPlaneError, StateStream, SyncRequest};
use crate::labels::Selector;
use crate::types::{DeploymentStateReport, SentinelStateReport, State};

const EVENT_BUFFER: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

type Key = (String, String);

fn key_of<K: Resource>(object: &K) -> Result<Key, ClusterError> {
    let meta = object.meta();
    let namespace = meta
        .namespace
        .clone()
        .ok_or_else(|| ClusterError::invalid_object("metadata.namespace is required"))?;
    let name = meta
        .name
        .clone()
        .ok_or_else(|| ClusterError::invalid_object("metadata.name is required"))?;
    Ok((namespace, name))
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct Objects {
    namespaces: BTreeMap<String, Namespace>,
    network_policies: BTreeMap<Key, NetworkPolicy>,
    replica_sets: BTreeMap<Key, ReplicaSet>,
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    pods: BTreeMap<Key, Pod>,
    next_uid: u64,
}

impl Objects {
    fn uid(&mut self) -> String {
        self.next_uid += 1;
        format!("uid-{}", self.next_uid)
    }
}

/// Server-side apply onto `store`: the desired object replaces the stored
/// one, keeping identity and status.
fn upsert<K>(
    store: &mut BTreeMap<Key, K>,
    uid: impl FnOnce() -> String,
    desired: &K,
    keep_status: impl FnOnce(&K, &mut K),
) -> Result<K, ClusterError>
where
    K: Resource + Clone,
{
    let key = key_of(desired)?;
    let mut applied = desired.clone();
    match store.get(&key) {
        Some(existing) => {
            applied.meta_mut().uid.clone_from(&existing.meta().uid);
            keep_status(existing, &mut applied);
        }
        None => applied.meta_mut().uid = Some(uid()),
    }
    store.insert(key, applied.clone());
    Ok(applied)
}

fn page_of<K: Resource + Clone>(
    store: &BTreeMap<Key, K>,
    selector: &Selector,
    page: &PageRequest,
) -> Result<ListPage<K>, ClusterError> {
    let offset = match &page.continue_token {
        Some(token) => token
            .parse::<usize>()
            .map_err(|_| ClusterError::api(410, "continue token expired"))?,
        None => 0,
    };
    let limit = usize::try_from(page.limit).unwrap_or(usize::MAX).max(1);
    let matching: Vec<K> = store
        .values()
        .filter(|object| selector.matches(object.meta().labels.as_ref()))
        .cloned()
        .collect();
    let items: Vec<K> = matching.iter().skip(offset).take(limit).cloned().collect();
    let next = offset + items.len();
    Ok(ListPage {
        items,
        continue_token: (next < matching.len()).then(|| next.to_string()),
    })
}

fn subscribe<K>(events: broadcast::Receiver<WatchEvent<K>>, selector: Selector) -> WatchStream<K>
where
    K: Resource + Clone + Send + 'static,
{
    stream::unfold((events, selector), |(mut events, selector)| async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let matched = match &event {
                        WatchEvent::Applied(object) | WatchEvent::Deleted(object) => {
                            selector.matches(object.meta().labels.as_ref())
                        }
                    };
                    if matched {
                        return Some((Ok(event), (events, selector)));
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    let err = ClusterError::watch(format!("missed {missed} events"));
                    return Some((Err(err), (events, selector)));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// A cluster kept in memory. Applies replace objects wholesale while
/// keeping uid and status; changes to replica sets and deployments are
/// broadcast to watchers.
pub struct InMemoryCluster {
    objects: Mutex<Objects>,
    replica_set_events: broadcast::Sender<WatchEvent<ReplicaSet>>,
    deployment_events: broadcast::Sender<WatchEvent<Deployment>>,
    apply_failure: Mutex<Option<ClusterError>>,
    list_failure: Mutex<Option<ClusterError>>,
    service_delete_failure: Mutex<Option<ClusterError>>,
    applies: AtomicUsize,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self {
            objects: Mutex::default(),
            replica_set_events: broadcast::channel(EVENT_BUFFER).0,
            deployment_events: broadcast::channel(EVENT_BUFFER).0,
            apply_failure: Mutex::default(),
            list_failure: Mutex::default(),
            service_delete_failure: Mutex::default(),
            applies: AtomicUsize::new(0),
        }
    }
}

impl InMemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every apply fail with `error` until cleared with `None`.
    pub fn fail_applies(&self, error: Option<ClusterError>) {
        *lock(&self.apply_failure) = error;
    }

    /// Make every list fail with `error` until cleared with `None`.
    pub fn fail_lists(&self, error: Option<ClusterError>) {
        *lock(&self.list_failure) = error;
    }

    /// Make every service delete fail with `error` until cleared with `None`.
    pub fn fail_service_deletes(&self, error: Option<ClusterError>) {
        *lock(&self.service_delete_failure) = error;
    }

    /// Apply calls that reached the store.
    #[must_use]
    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    fn check_apply(&self) -> Result<(), ClusterError> {
        match lock(&self.apply_failure).clone() {
            Some(err) => Err(err),
            None => {
                self.applies.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn check_list(&self) -> Result<(), ClusterError> {
        lock(&self.list_failure).clone().map_or(Ok(()), Err)
    }

    /// Store a replica set as if created out of band.
    pub fn insert_replica_set(&self, replica_set: ReplicaSet) -> Result<(), ClusterError> {
        let key = key_of(&replica_set)?;
        lock(&self.objects).replica_sets.insert(key, replica_set.clone());
        self.replica_set_events
            .send(WatchEvent::Applied(replica_set))
            .ok();
        Ok(())
    }

    /// Store a deployment as if created out of band.
    pub fn insert_deployment(&self, deployment: Deployment) -> Result<(), ClusterError> {
        let key = key_of(&deployment)?;
        lock(&self.objects).deployments.insert(key, deployment.clone());
        self.deployment_events.send(WatchEvent::Applied(deployment)).ok();
        Ok(())
    }

    /// Store a pod.
    pub fn insert_pod(&self, pod: Pod) -> Result<(), ClusterError> {
        let key = key_of(&pod)?;
        lock(&self.objects).pods.insert(key, pod);
        Ok(())
    }

    /// Update a stored deployment's available replicas and notify watchers.
    pub fn set_available_replicas(&self, namespace: &str, name: &str, available: i32) -> Result<(), ClusterError> {
        let updated = {
            let mut objects = lock(&self.objects);
            let deployment = objects
                .deployments
                .get_mut(&key(namespace, name))
                .ok_or_else(|| ClusterError::not_found(format!("deployments/{name}")))?;
            deployment
                .status
                .get_or_insert_with(DeploymentStatus::default)
                .available_replicas = Some(available);
            deployment.clone()
        };
        self.deployment_events.send(WatchEvent::Applied(updated)).ok();
        Ok(())
    }

    #[must_use]
    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        lock(&self.objects).namespaces.get(name).cloned()
    }

    #[must_use]
    pub fn network_policy(&self, namespace: &str, name: &str) -> Option<NetworkPolicy> {
        lock(&self.objects).network_policies.get(&key(namespace, name)).cloned()
    }

    #[must_use]
    pub fn replica_set(&self, namespace: &str, name: &str) -> Option<ReplicaSet> {
        lock(&self.objects).replica_sets.get(&key(namespace, name)).cloned()
    }

    #[must_use]
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        lock(&self.objects).deployments.get(&key(namespace, name)).cloned()
    }

    #[must_use]
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        lock(&self.objects).services.get(&key(namespace, name)).cloned()
    }

    #[must_use]
    pub fn replica_set_count(&self) -> usize {
        lock(&self.objects).replica_sets.len()
    }

    #[must_use]
    pub fn deployment_count(&self) -> usize {
        lock(&self.objects).deployments.len()
    }

    #[must_use]
    pub fn service_count(&self) -> usize {
        lock(&self.objects).services.len()
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), ClusterError> {
        let name = namespace
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::invalid_object("metadata.name is required"))?;
        let mut objects = lock(&self.objects);
        if objects.namespaces.contains_key(&name) {
            return Err(ClusterError::already_exists(format!("namespaces/{name}")));
        }
        objects.namespaces.insert(name, namespace.clone());
        Ok(())
    }

    async fn apply_network_policy(
        &self,
        policy: &NetworkPolicy,
        _field_manager: &str,
    ) -> Result<NetworkPolicy, ClusterError> {
        self.check_apply()?;
        let mut objects = lock(&self.objects);
        let uid = objects.uid();
        upsert(&mut objects.network_policies, || uid, policy, |_, _| {})
    }

    async fn apply_replica_set(
        &self,
        replica_set: &ReplicaSet,
        _field_manager: &str,
    ) -> Result<ReplicaSet, ClusterError> {
        self.check_apply()?;
        let applied = {
            let mut objects = lock(&self.objects);
            let uid = objects.uid();
            upsert(
                &mut objects.replica_sets,
                || uid,
                replica_set,
                |existing, applied| applied.status.clone_from(&existing.status),
            )?
        };
        self.replica_set_events
            .send(WatchEvent::Applied(applied.clone()))
            .ok();
        Ok(applied)
    }

    async fn apply_deployment(
        &self,
        deployment: &Deployment,
        _field_manager: &str,
    ) -> Result<Deployment, ClusterError> {
        self.check_apply()?;
        let applied = {
            let mut objects = lock(&self.objects);
            let uid = objects.uid();
            upsert(
                &mut objects.deployments,
                || uid,
                deployment,
                |existing, applied| applied.status.clone_from(&existing.status),
            )?
        };
        self.deployment_events
            .send(WatchEvent::Applied(applied.clone()))
            .ok();
        Ok(applied)
    }

    async fn apply_service(
        &self,
        service: &Service,
        _field_manager: &str,
    ) -> Result<Service, ClusterError> {
        self.check_apply()?;
        let mut objects = lock(&self.objects);
        let uid = objects.uid();
        upsert(
            &mut objects.services,
            || uid,
            service,
            |existing, applied| applied.status.clone_from(&existing.status),
        )
    }

    async fn delete_replica_set(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let removed = lock(&self.objects).replica_sets.remove(&key(namespace, name));
        let removed = removed.ok_or_else(|| ClusterError::not_found(format!("replicasets/{name}")))?;
        self.replica_set_events.send(WatchEvent::Deleted(removed)).ok();
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let removed = {
            let mut objects = lock(&self.objects);
            let removed = objects
                .deployments
                .remove(&key(namespace, name))
                .ok_or_else(|| ClusterError::not_found(format!("deployments/{name}")))?;
            // Garbage-collect dependents the way the cluster would.
            let owner_uid = removed.metadata.uid.clone();
            objects.services.retain(|_, service| {
                !service
                    .metadata
                    .owner_references
                    .iter()
                    .flatten()
                    .any(|owner| Some(&owner.uid) == owner_uid.as_ref())
            });
            removed
        };
        self.deployment_events.send(WatchEvent::Deleted(removed)).ok();
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        if let Some(err) = lock(&self.service_delete_failure).clone() {
            return Err(err);
        }
        lock(&self.objects)
            .services
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterError::not_found(format!("services/{name}")))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Pod>, ClusterError> {
        self.check_list()?;
        Ok(lock(&self.objects)
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && selector.matches(pod.metadata.labels.as_ref()))
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn list_replica_sets(
        &self,
        selector: &Selector,
        page: PageRequest,
    ) -> Result<ListPage<ReplicaSet>, ClusterError> {
        self.check_list()?;
        page_of(&lock(&self.objects).replica_sets, selector, &page)
    }

    async fn list_deployments(
        &self,
        selector: &Selector,
        page: PageRequest,
    ) -> Result<ListPage<Deployment>, ClusterError> {
        self.check_list()?;
        page_of(&lock(&self.objects).deployments, selector, &page)
    }

    async fn watch_replica_sets(
        &self,
        selector: &Selector,
    ) -> Result<WatchStream<ReplicaSet>, ClusterError> {
        Ok(subscribe(self.replica_set_events.subscribe(), selector.clone()))
    }

    async fn watch_deployments(
        &self,
        selector: &Selector,
    ) -> Result<WatchStream<Deployment>, ClusterError> {
        Ok(subscribe(self.deployment_events.subscribe(), selector.clone()))
    }
}

enum Script {
    Stream(Vec<Result<State, ControlPlaneError>>),
    Refuse(ControlPlaneError),
}

/// A scripted control plane recording every call.
///
/// Sync sessions are served from a queue; once it is empty `sync` hands
/// out a stream that never yields.
#[derive(Default)]
pub struct FakeControlPlane {
    scripts: Mutex<VecDeque<Script>>,
    sync_requests: Mutex<Vec<SyncRequest>>,
    desired_deployments: Mutex<HashMap<String, State>>,
    desired_sentinels: Mutex<HashMap<String, State>>,
    deployment_reports: Mutex<Vec<DeploymentStateReport>>,
    sentinel_reports: Mutex<Vec<SentinelStateReport>>,
    update_failure: Mutex<Option<ControlPlaneError>>,
    update_calls: AtomicUsize,
    stall_lookups: AtomicBool,
    stall_updates: AtomicBool,
}

impl FakeControlPlane {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a session delivering `records` and then closing cleanly.
    pub fn push_session(&self, records: Vec<State>) {
        lock(&self.scripts).push_back(Script::Stream(records.into_iter().map(Ok).collect()));
    }

    /// Queue a session delivering `records` and then failing with `error`.
    pub fn push_broken_session(&self, records: Vec<State>, error: ControlPlaneError) {
        let mut items: Vec<_> = records.into_iter().map(Ok).collect();
        items.push(Err(error));
        lock(&self.scripts).push_back(Script::Stream(items));
    }

    /// Queue a session that cannot be opened.
    pub fn push_refused_session(&self, error: ControlPlaneError) {
        lock(&self.scripts).push_back(Script::Refuse(error));
    }

    pub fn set_desired_deployment(&self, deployment_id: &str, state: State) {
        lock(&self.desired_deployments).insert(deployment_id.to_string(), state);
    }

    pub fn set_desired_sentinel(&self, sentinel_id: &str, state: State) {
        lock(&self.desired_sentinels).insert(sentinel_id.to_string(), state);
    }

    /// Make every state update fail with `error` until cleared with `None`.
    pub fn fail_updates(&self, error: Option<ControlPlaneError>) {
        *lock(&self.update_failure) = error;
    }

    /// Make desired-state lookups hang forever while set.
    pub fn stall_lookups(&self, stall: bool) {
        self.stall_lookups.store(stall, Ordering::SeqCst);
    }

    /// Make state updates hang forever while set.
    pub fn stall_updates(&self, stall: bool) {
        self.stall_updates.store(stall, Ordering::SeqCst);
    }

    #[must_use]
    pub fn sync_requests(&self) -> Vec<SyncRequest> {
        lock(&self.sync_requests).clone()
    }

    #[must_use]
    pub fn deployment_reports(&self) -> Vec<DeploymentStateReport> {
        lock(&self.deployment_reports).clone()
    }

    #[must_use]
    pub fn sentinel_reports(&self) -> Vec<SentinelStateReport> {
        lock(&self.sentinel_reports).clone()
    }

    /// Update calls that reached this control plane.
    #[must_use]
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    async fn check_lookup(&self) {
        if self.stall_lookups.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    async fn check_update(&self) -> Result<(), ControlPlaneError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.stall_updates.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        lock(&self.update_failure).clone().map_or(Ok(()), Err)
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn sync(&self, request: SyncRequest) -> Result<StateStream, ControlPlaneError> {
        lock(&self.sync_requests).push(request);
        let script = lock(&self.scripts).pop_front();
        match script {
            Some(Script::Stream(items)) => Ok(stream::iter(items).boxed()),
            Some(Script::Refuse(err)) => Err(err),
            None => Ok(stream::pending().boxed()),
        }
    }

    async fn get_desired_deployment_state(
        &self,
        deployment_id: &str,
    ) -> Result<State, ControlPlaneError> {
        self.check_lookup().await;
        lock(&self.desired_deployments)
            .get(deployment_id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::not_found(format!("deployment {deployment_id}")))
    }

    async fn get_desired_sentinel_state(
        &self,
        sentinel_id: &str,
    ) -> Result<State, ControlPlaneError> {
        self.check_lookup().await;
        lock(&self.desired_sentinels)
            .get(sentinel_id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::not_found(format!("sentinel {sentinel_id}")))
    }

    async fn update_deployment_state(
        &self,
        report: DeploymentStateReport,
    ) -> Result<(), ControlPlaneError> {
        self.check_update().await?;
        lock(&self.deployment_reports).push(report);
        Ok(())
    }

    async fn update_sentinel_state(
        &self,
        report: SentinelStateReport,
    ) -> Result<(), ControlPlaneError> {
        self.check_update().await?;
        lock(&self.sentinel_reports).push(report);
        Ok(())
    }
}
