//! End-to-end tests for the watch and refresh loops and the control-plane
//! circuit breaker.
//!
//! These tests verify that:
//! - Refresh repairs drift and removes objects the control plane deleted
//! - Watched changes are reported without a desired-state record
//! - An unhealthy control plane trips the breaker without blocking the
//!   cluster side

#![forbid(clippy::unwrap_used)]
#![forbid(clippy::expect_used)]
#![forbid(clippy::panic)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{
    NAMESPACE, SENTINEL_NAMESPACE, SETTLE, TestResult, apply_deployment, apply_sentinel,
    delete_deployment, deployment, deployment_name, harness, harness_with, sentinel,
    sentinel_name,
};
use moor::moor_breaker::{CircuitState, ManualClock};
use moor::moor_reconciler::testing::{FakeControlPlane, InMemoryCluster, eventually};
use moor::moor_reconciler::{
    ClusterApi, Component, ControlPlaneError, DeploymentStateReport, LifecycleHook,
    SentinelStateReport,
};
use moor::{Error, Reconciler};

fn replicas(h: &common::Harness, id: &str) -> Option<i32> {
    h.cluster
        .replica_set(NAMESPACE, &deployment_name(id))
        .and_then(|rs| rs.spec)
        .and_then(|spec| spec.replicas)
}

/// A refresh pass puts drifted objects back.
///
/// # GIVEN
/// A deployment whose replica set was scaled down out of band
///
/// # WHEN
/// A refresh pass runs
///
/// # THEN
/// The replica set is back at the desired replica count
#[tokio::test]
async fn test_refresh_repairs_drift() -> TestResult {
    let h = harness()?;
    h.reconciler.apply_deployment(&deployment("d_1")).await?;
    h.control_plane
        .set_desired_deployment("d_1", apply_deployment(10, "d_1"));

    let mut drifted = h
        .cluster
        .replica_set(NAMESPACE, &deployment_name("d_1"))
        .ok_or("replica set missing")?;
    if let Some(spec) = drifted.spec.as_mut() {
        spec.replicas = Some(1);
    }
    h.cluster.insert_replica_set(drifted)?;
    assert_eq!(replicas(&h, "d_1"), Some(1));

    let visited = h.reconciler.refresh(Component::Deployment).await?;

    assert_eq!(visited, 1);
    assert_eq!(replicas(&h, "d_1"), Some(3));
    Ok(())
}

/// A refresh pass deletes objects the control plane wants gone, and one
/// object's failure does not stop the pass.
#[tokio::test]
async fn test_refresh_applies_deletes_and_isolates_failures() -> TestResult {
    let h = harness()?;
    h.reconciler.apply_deployment(&deployment("d_1")).await?;
    h.reconciler.apply_deployment(&deployment("d_2")).await?;
    h.reconciler.apply_deployment(&deployment("d_3")).await?;
    h.control_plane
        .set_desired_deployment("d_1", delete_deployment(20, "d_1"));
    h.control_plane
        .set_desired_deployment("d_3", apply_deployment(21, "d_3"));

    let visited = h.reconciler.refresh(Component::Deployment).await?;

    assert_eq!(visited, 3);
    assert!(h.cluster.replica_set(NAMESPACE, &deployment_name("d_1")).is_none());
    assert!(h.cluster.replica_set(NAMESPACE, &deployment_name("d_2")).is_some());
    assert!(h.cluster.replica_set(NAMESPACE, &deployment_name("d_3")).is_some());
    Ok(())
}

/// Refresh walks every page.
#[tokio::test]
async fn test_refresh_paginates() -> TestResult {
    let mut config = common::config();
    config.refresh.page_size = 2;
    let h = harness_with(config)?;
    for id in ["s_1", "s_2", "s_3", "s_4", "s_5"] {
        h.reconciler.apply_sentinel(&sentinel(id)).await?;
        h.control_plane
            .set_desired_sentinel(id, apply_sentinel(1, id));
    }

    let visited = h.reconciler.refresh(Component::Sentinel).await?;

    assert_eq!(visited, 5);
    Ok(())
}

/// A failed list aborts the pass.
#[tokio::test]
async fn test_refresh_list_failure_is_returned() -> TestResult {
    let h = harness()?;
    h.cluster
        .fail_lists(Some(moor::moor_reconciler::ClusterError::transport("connection refused")));

    let result = h.reconciler.refresh(Component::Deployment).await;

    assert!(matches!(result, Err(Error::Cluster { .. })));
    Ok(())
}

/// Refresh does not count as stream progress.
#[tokio::test]
async fn test_refresh_leaves_processed_watermark_alone() -> TestResult {
    let h = harness()?;
    h.reconciler.apply_deployment(&deployment("d_1")).await?;
    h.control_plane
        .set_desired_deployment("d_1", apply_deployment(40, "d_1"));

    h.reconciler.refresh(Component::Deployment).await?;

    assert_eq!(h.reconciler.cursor().processed(), 0);
    assert_eq!(h.reconciler.cursor().committed(), 0);
    Ok(())
}

/// The refresh loop repairs drift without any sync traffic.
#[tokio::test(start_paused = true)]
async fn test_refresh_loop_runs_on_start() -> TestResult {
    let h = harness()?;
    h.reconciler.apply_deployment(&deployment("d_1")).await?;
    h.control_plane
        .set_desired_deployment("d_1", apply_deployment(10, "d_1"));
    let mut drifted = h
        .cluster
        .replica_set(NAMESPACE, &deployment_name("d_1"))
        .ok_or("replica set missing")?;
    if let Some(spec) = drifted.spec.as_mut() {
        spec.replicas = Some(0);
    }
    h.cluster.insert_replica_set(drifted)?;

    h.reconciler.start().await?;

    let repaired = eventually(SETTLE, || replicas(&h, "d_1") == Some(3)).await;
    assert!(repaired, "refresh loop did not repair drift");

    h.reconciler.stop().await?;
    Ok(())
}

/// Watched changes are reported as they happen.
///
/// # GIVEN
/// A started reconciler and an applied sentinel
///
/// # WHEN
/// The sentinel becomes available and a workload is removed out of band
///
/// # THEN
/// Both changes are reported to the control plane
#[tokio::test(start_paused = true)]
async fn test_watch_reports_changes() -> TestResult {
    let h = harness()?;
    let sentinel_name = sentinel_name("s_1");
    h.reconciler.start().await?;
    h.reconciler.apply_sentinel(&sentinel("s_1")).await?;
    h.reconciler.apply_deployment(&deployment("d_1")).await?;

    h.cluster
        .set_available_replicas(SENTINEL_NAMESPACE, &sentinel_name, 2)?;
    h.cluster
        .delete_replica_set(NAMESPACE, &deployment_name("d_1"))
        .await?;

    let available = SentinelStateReport::Update {
        k8s_name: sentinel_name,
        available_replicas: 2,
    };
    let reported = eventually(SETTLE, || {
        h.control_plane.sentinel_reports().contains(&available)
    })
    .await;
    assert!(reported, "sentinel availability was not reported");

    let removed = DeploymentStateReport::Delete {
        k8s_name: deployment_name("d_1"),
    };
    let reported = eventually(SETTLE, || {
        h.control_plane.deployment_reports().contains(&removed)
    })
    .await;
    assert!(reported, "replica set removal was not reported");

    h.reconciler.stop().await?;
    Ok(())
}

/// Unmanaged objects are not watched.
#[tokio::test(start_paused = true)]
async fn test_watch_ignores_unmanaged_objects() -> TestResult {
    let h = harness()?;
    h.reconciler.start().await?;

    let mut foreign = moor::moor_reconciler::build_deployment(&sentinel("s_9"), "someone-else");
    foreign.metadata.namespace = Some("other".into());
    h.cluster.insert_deployment(foreign)?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(h.control_plane.sentinel_reports().is_empty());
    h.reconciler.stop().await?;
    Ok(())
}

fn breaker_harness(clock: Arc<ManualClock>) -> Result<common::Harness, Error> {
    let mut config = common::config();
    config.breaker.trip_threshold = 2;
    config.breaker.max_requests = 1;
    config.breaker.timeout_ms = 60_000;
    let cluster = Arc::new(InMemoryCluster::new());
    let control_plane = Arc::new(FakeControlPlane::new());
    let reconciler = Reconciler::builder()
        .with_config(config)
        .with_cluster(cluster.clone())
        .with_control_plane(control_plane.clone())
        .with_breaker_clock(clock)
        .build()?;
    Ok(common::Harness {
        reconciler,
        cluster,
        control_plane,
    })
}

/// An unhealthy control plane trips the breaker; the cluster side keeps
/// converging and recovery closes it again.
///
/// # GIVEN
/// A breaker tripping after two failures
///
/// # WHEN
/// Reports keep failing, then the control plane recovers after the open
/// timeout
///
/// # THEN
/// The third report is rejected without a call, applies still land, and a
/// successful probe closes the breaker
#[tokio::test]
async fn test_breaker_isolates_control_plane_outage() -> TestResult {
    let clock = Arc::new(ManualClock::new());
    let h = breaker_harness(clock.clone())?;
    h.control_plane
        .fail_updates(Some(ControlPlaneError::unavailable("503")));

    for id in ["d_1", "d_2"] {
        let result = h.reconciler.apply_deployment(&deployment(id)).await;
        assert!(matches!(result, Err(Error::ControlPlane(_))));
    }
    assert_eq!(h.reconciler.breaker_state(), CircuitState::Open);

    let rejected = h.reconciler.apply_deployment(&deployment("d_3")).await;
    assert!(rejected.as_ref().is_err_and(Error::is_breaker_rejection));
    assert_eq!(h.control_plane.update_calls(), 2);
    assert_eq!(h.cluster.replica_set_count(), 3);

    clock.advance(Duration::from_secs(61));
    h.control_plane.fail_updates(None);
    h.reconciler.apply_deployment(&deployment("d_3")).await?;

    assert_eq!(h.reconciler.breaker_state(), CircuitState::Closed);
    assert_eq!(h.control_plane.deployment_reports().len(), 1);
    Ok(())
}

/// A control plane that does not know an object is not an outage.
#[tokio::test]
async fn test_not_found_does_not_trip_breaker() -> TestResult {
    let clock = Arc::new(ManualClock::new());
    let h = breaker_harness(clock)?;
    h.control_plane
        .fail_updates(Some(ControlPlaneError::not_found("deployment d_1")));

    for _ in 0..5 {
        let result = h.reconciler.apply_deployment(&deployment("d_1")).await;
        assert!(matches!(result, Err(Error::ControlPlane(_))));
    }

    assert_eq!(h.reconciler.breaker_state(), CircuitState::Closed);
    assert_eq!(h.control_plane.update_calls(), 5);
    Ok(())
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl Recorder {
    fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn record(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl LifecycleHook for Recorder {
    async fn on_start(&self, instance_id: &str) -> anyhow::Result<()> {
        self.record(format!("start:{instance_id}"));
        Ok(())
    }

    async fn on_stop(&self, instance_id: &str) -> anyhow::Result<()> {
        self.record(format!("stop:{instance_id}"));
        Ok(())
    }
}

/// Start and stop are announced to the lifecycle hook.
#[tokio::test(start_paused = true)]
async fn test_lifecycle_hook_is_notified() -> TestResult {
    let hook = Arc::new(Recorder::default());
    let reconciler = Reconciler::builder()
        .with_config(common::config())
        .with_cluster(Arc::new(InMemoryCluster::new()))
        .with_control_plane(Arc::new(FakeControlPlane::new()))
        .with_lifecycle_hook(hook.clone())
        .build()?;

    reconciler.start().await?;
    let started = eventually(SETTLE, || hook.calls() == ["start:moor-test"]).await;
    assert!(started);

    reconciler.stop().await?;
    let stopped = eventually(SETTLE, || hook.calls().len() == 2).await;
    assert!(stopped);
    assert_eq!(hook.calls()[1], "stop:moor-test");
    Ok(())
}

/// Start and stop misuse is reported, not ignored.
#[tokio::test]
async fn test_start_and_stop_misuse() -> TestResult {
    let h = harness()?;

    assert!(matches!(h.reconciler.stop().await, Err(Error::NotStarted)));
    h.reconciler.start().await?;
    assert!(matches!(h.reconciler.start().await, Err(Error::AlreadyStarted)));
    h.reconciler.stop().await?;
    h.reconciler.stop().await?;
    Ok(())
}

/// Stop returns while a refresh pass waits on the control plane.
///
/// # GIVEN
/// A managed deployment and a control plane whose desired-state lookups
/// never answer
///
/// # WHEN
/// The reconciler is started and then stopped
///
/// # THEN
/// Stop completes instead of waiting for the lookup
#[tokio::test(start_paused = true)]
async fn test_stop_abandons_stalled_refresh() -> TestResult {
    let h = harness()?;
    h.reconciler.apply_deployment(&deployment("d_1")).await?;
    h.control_plane.stall_lookups(true);

    h.reconciler.start().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), h.reconciler.stop()).await??;
    Ok(())
}

/// Stop returns while streamed and watched changes wait on a report.
///
/// # GIVEN
/// A sync session delivering one deployment and a control plane whose
/// state updates never answer
///
/// # WHEN
/// The record is being applied and the reconciler is stopped
///
/// # THEN
/// Stop completes and nothing is committed
#[tokio::test(start_paused = true)]
async fn test_stop_abandons_stalled_report() -> TestResult {
    let h = harness()?;
    h.control_plane.stall_updates(true);
    h.control_plane.push_session(vec![apply_deployment(5, "d_1")]);

    h.reconciler.start().await?;
    let stalled = eventually(SETTLE, || h.control_plane.update_calls() >= 1).await;
    assert!(stalled, "record was never applied");

    tokio::time::timeout(Duration::from_secs(5), h.reconciler.stop()).await??;
    assert_eq!(h.reconciler.cursor().committed(), 0);
    Ok(())
}
