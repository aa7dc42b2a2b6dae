//! Refresh loops: periodically re-derive every managed object from the
//! control plane's desired state.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use moor_core::ResultExt;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::cluster::PageRequest;
use crate::error::{Error, Result};
use crate::labels::{Component, Selector};
use crate::reconciler::{Core, stopped};

/// Tick every `refresh.interval`, starting immediately, until `stop` fires.
/// A pass in flight is abandoned on stop.
pub(crate) async fn run(core: Arc<Core>, component: Component, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(core.config.refresh.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(%component, interval_secs = core.config.refresh.interval_secs, "refresh loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = stopped(&mut stop) => break,
        }
        let pass = tokio::select! {
            pass = refresh(&core, component) => pass,
            () = stopped(&mut stop) => break,
        };
        match pass {
            Ok(count) => debug!(%component, count, "refresh pass complete"),
            Err(err) => error!(%component, error = %err, "refresh pass aborted"),
        }
    }
    info!(%component, "refresh loop stopped");
}

/// One pass over every managed object of `component`, page by page.
/// Returns the number of objects visited. Only a failed list call aborts
/// the pass; per-object failures are logged.
pub(crate) async fn refresh(core: &Core, component: Component) -> Result<usize> {
    let selector = Selector::managed(&core.config.field_manager, component);
    let mut page = PageRequest::first(core.config.refresh.page_size);
    let mut visited = 0;

    loop {
        let (objects, continue_token) = list_page(core, component, &selector, page.clone()).await?;
        for meta in &objects {
            visited += 1;
            let span = info_span!(
                "refresh",
                %component,
                namespace = meta.namespace.as_deref().unwrap_or_default(),
                name = meta.name.as_deref().unwrap_or_default(),
            );
            async {
                reconcile_object(core, component, meta)
                    .await
                    .warn_on_err("failed to refresh object");
            }
            .instrument(span)
            .await;
        }

        match continue_token {
            Some(token) => page.continue_token = Some(token),
            None => return Ok(visited),
        }
    }
}

async fn list_page(
    core: &Core,
    component: Component,
    selector: &Selector,
    page: PageRequest,
) -> Result<(Vec<ObjectMeta>, Option<String>)> {
    match component {
        Component::Deployment => {
            let list = core
                .cluster
                .list_replica_sets(selector, page)
                .await
                .map_err(|err| Error::cluster("list replica sets", err))?;
            let metas = list.items.into_iter().map(|rs| rs.metadata).collect();
            Ok((metas, list.continue_token))
        }
        Component::Sentinel => {
            let list = core
                .cluster
                .list_deployments(selector, page)
                .await
                .map_err(|err| Error::cluster("list deployments", err))?;
            let metas = list.items.into_iter().map(|d| d.metadata).collect();
            Ok((metas, list.continue_token))
        }
    }
}

/// Fetch the desired state for one object and dispatch it the same way as
/// streamed records. The processed watermark is left alone.
async fn reconcile_object(core: &Core, component: Component, meta: &ObjectMeta) -> Result<()> {
    let id = meta
        .labels
        .as_ref()
        .and_then(|labels| labels.get(component.id_label()));
    let Some(id) = id else {
        warn!(label = component.id_label(), "managed object has no id label, skipping");
        return Ok(());
    };

    let desired = match component {
        Component::Deployment => core.control_plane.get_desired_deployment_state(id).await?,
        Component::Sentinel => core.control_plane.get_desired_sentinel_state(id).await?,
    };
    core.dispatch(&desired).await?;
    Ok(())
}
