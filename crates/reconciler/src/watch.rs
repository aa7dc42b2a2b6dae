//! Watch loops: report state whenever a managed object changes.
//!
//! A failed or closed subscription is logged and not re-established; the
//! refresh loop covers whatever is missed afterwards.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use moor_core::ResultExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cluster::{WatchEvent, WatchStream};
use crate::error::Result;
use crate::labels::Component;
use crate::reconciler::{Core, stopped};
use crate::status;
use crate::types::{DeploymentStateReport, SentinelStateReport};

fn object_name<K: kube::Resource>(object: &K) -> String {
    object.meta().name.clone().unwrap_or_default()
}

/// Consume `events` until it ends or `stop` fires.
async fn drain<K, F, Fut>(
    component: Component,
    mut events: WatchStream<K>,
    mut stop: watch::Receiver<bool>,
    mut handle: F,
) where
    F: FnMut(WatchEvent<K>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    info!(%component, "watch loop started");
    loop {
        let event = tokio::select! {
            event = events.next() => event,
            () = stopped(&mut stop) => break,
        };
        match event {
            Some(Ok(event)) => {
                let handled = tokio::select! {
                    handled = handle(event) => handled,
                    () = stopped(&mut stop) => break,
                };
                handled.warn_on_err("failed to report watched object");
            }
            Some(Err(err)) => warn!(%component, error = %err, "watch stream error"),
            None => {
                warn!(%component, "watch stream closed");
                break;
            }
        }
    }
    info!(%component, "watch loop stopped");
}

pub(crate) async fn run_replica_sets(
    core: Arc<Core>,
    events: WatchStream<ReplicaSet>,
    stop: watch::Receiver<bool>,
) {
    drain(Component::Deployment, events, stop, |event| {
        let core = Arc::clone(&core);
        async move {
            match event {
                WatchEvent::Applied(replica_set) => {
                    debug!(name = %object_name(&replica_set), "replica set changed");
                    status::report_replica_set(&core, &replica_set).await
                }
                WatchEvent::Deleted(replica_set) => {
                    debug!(name = %object_name(&replica_set), "replica set deleted");
                    let report = DeploymentStateReport::Delete {
                        k8s_name: object_name(&replica_set),
                    };
                    status::send_deployment_report(&core, report).await
                }
            }
        }
    })
    .await;
}

pub(crate) async fn run_sentinels(
    core: Arc<Core>,
    events: WatchStream<Deployment>,
    stop: watch::Receiver<bool>,
) {
    drain(Component::Sentinel, events, stop, |event| {
        let core = Arc::clone(&core);
        async move {
            match event {
                WatchEvent::Applied(deployment) => {
                    debug!(name = %object_name(&deployment), "sentinel changed");
                    status::report_sentinel(&core, &deployment).await
                }
                WatchEvent::Deleted(deployment) => {
                    debug!(name = %object_name(&deployment), "sentinel deleted");
                    let report = SentinelStateReport::Delete {
                        k8s_name: object_name(&deployment),
                    };
                    status::send_sentinel_report(&core, report).await
                }
            }
        }
    })
    .await;
}
