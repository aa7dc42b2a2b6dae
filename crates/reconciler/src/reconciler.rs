//! Reconciler implementation.

use std::fmt;
use std::sync::Arc;

use moor_breaker::{
    BreakerConfig, BreakerMetrics, CircuitBreaker, CircuitState, Clock, TracingMetrics,
};
use moor_core::ReconcilerConfig;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::cluster::ClusterApi;
use crate::control_plane::{ControlPlane, ControlPlaneError};
use crate::cursor::ResumeCursor;
use crate::error::{Error, Result};
use crate::labels::{Component, Selector};
use crate::lifecycle::{LifecycleHook, Transition, notify_detached};
use crate::types::{
    ApplyDeployment, ApplySentinel, DeleteDeployment, DeleteSentinel, DeploymentState,
    SentinelState, State, StateKind,
};
use crate::{deployment, refresh, sentinel, sync};

/// State shared by every reconciler task.
pub(crate) struct Core {
    pub(crate) config: ReconcilerConfig,
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) control_plane: Arc<dyn ControlPlane>,
    pub(crate) breaker: CircuitBreaker<ControlPlaneError>,
    pub(crate) cursor: ResumeCursor,
}

impl Core {
    /// Dispatch one streamed record and mark it processed. Does not commit
    /// the cursor.
    pub(crate) async fn handle_state(&self, state: Option<&State>) -> Result<u64> {
        let state = state.ok_or(Error::NilState)?;
        let sequence = self.dispatch(state).await?;
        if !matches!(state.kind, Some(StateKind::Bookmark(_))) {
            self.cursor.observe(sequence);
        }
        Ok(sequence)
    }

    /// Apply or delete what `state` describes and return its watermark,
    /// without touching the cursor.
    pub(crate) async fn dispatch(&self, state: &State) -> Result<u64> {
        let kind = state.kind.as_ref().ok_or(Error::UnknownStateType)?;

        match kind {
            StateKind::Bookmark(bookmark) => {
                debug!(sequence = bookmark.sequence, "received bookmark");
                return Ok(bookmark.sequence);
            }
            StateKind::Deployment(DeploymentState::Apply(request)) => {
                debug!(sequence = state.sequence, deployment_id = %request.deployment_id, "applying deployment");
                deployment::apply(self, request).await?;
            }
            StateKind::Deployment(DeploymentState::Delete(request)) => {
                debug!(sequence = state.sequence, name = %request.k8s_name, "deleting deployment");
                deployment::delete(self, request).await?;
            }
            StateKind::Sentinel(SentinelState::Apply(request)) => {
                debug!(sequence = state.sequence, sentinel_id = %request.sentinel_id, "applying sentinel");
                sentinel::apply(self, request).await?;
            }
            StateKind::Sentinel(SentinelState::Delete(request)) => {
                debug!(sequence = state.sequence, name = %request.k8s_name, "deleting sentinel");
                sentinel::delete(self, request).await?;
            }
        }

        Ok(state.sequence)
    }
}

/// Resolves once `stop` is set or its sender is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

enum Phase {
    Idle,
    Running {
        stop: watch::Sender<bool>,
        tasks: Vec<JoinHandle<()>>,
    },
    Stopped,
}

/// Keeps the cluster converged on the control plane's desired state.
///
/// [`Reconciler::start`] runs five tasks: a watch loop and a refresh loop
/// per managed kind, plus the sync watcher. Dropping the reconciler stops
/// them as well.
pub struct Reconciler {
    core: Arc<Core>,
    hook: Option<Arc<dyn LifecycleHook>>,
    phase: Mutex<Phase>,
}

impl Reconciler {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> ReconcilerBuilder {
        ReconcilerBuilder::new()
    }

    /// Subscribe the watch loops, then spawn every loop.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` on a second call and `Cluster` when a watch
    /// subscription cannot be established.
    pub async fn start(&self) -> Result<()> {
        let mut phase = self.phase.lock().await;
        if !matches!(*phase, Phase::Idle) {
            return Err(Error::AlreadyStarted);
        }

        let config = &self.core.config;
        let manager = config.field_manager.as_str();
        let replica_sets = self
            .core
            .cluster
            .watch_replica_sets(&Selector::managed(manager, Component::Deployment))
            .await
            .map_err(|err| Error::cluster("watch replica sets", err))?;
        let sentinels = self
            .core
            .cluster
            .watch_deployments(&Selector::managed(manager, Component::Sentinel))
            .await
            .map_err(|err| Error::cluster("watch deployments", err))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let span = info_span!(
            "reconciler",
            instance_id = %config.instance_id,
            region = %config.region
        );
        let core = &self.core;
        let tasks = vec![
            tokio::spawn(
                crate::watch::run_replica_sets(Arc::clone(core), replica_sets, stop_rx.clone())
                    .instrument(span.clone()),
            ),
            tokio::spawn(
                crate::watch::run_sentinels(Arc::clone(core), sentinels, stop_rx.clone())
                    .instrument(span.clone()),
            ),
            tokio::spawn(
                refresh::run(Arc::clone(core), Component::Deployment, stop_rx.clone())
                    .instrument(span.clone()),
            ),
            tokio::spawn(
                refresh::run(Arc::clone(core), Component::Sentinel, stop_rx.clone())
                    .instrument(span.clone()),
            ),
            tokio::spawn(sync::run(Arc::clone(core), stop_rx).instrument(span)),
        ];

        *phase = Phase::Running {
            stop: stop_tx,
            tasks,
        };
        info!(
            instance_id = %config.instance_id,
            region = %config.region,
            "reconciler started"
        );
        self.notify(Transition::Start);
        Ok(())
    }

    /// Signal every loop to exit and wait for them.
    ///
    /// # Errors
    ///
    /// Returns `NotStarted` when called before [`Reconciler::start`]. A
    /// second call is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut phase = self.phase.lock().await;
        match std::mem::replace(&mut *phase, Phase::Stopped) {
            Phase::Idle => {
                *phase = Phase::Idle;
                Err(Error::NotStarted)
            }
            Phase::Stopped => Ok(()),
            Phase::Running { stop, tasks } => {
                if stop.send(true).is_err() {
                    debug!("reconciler tasks already exited");
                }
                for task in tasks {
                    if let Err(err) = task.await {
                        warn!(error = %err, "reconciler task ended abnormally");
                    }
                }
                info!(instance_id = %self.core.config.instance_id, "reconciler stopped");
                self.notify(Transition::Stop);
                Ok(())
            }
        }
    }

    /// Apply one desired-state record and return its watermark: the
    /// bookmark's own sequence for bookmarks, the record's otherwise.
    ///
    /// The resume cursor is not committed here; that happens when the
    /// stream delivering the record closes cleanly.
    ///
    /// # Errors
    ///
    /// `NilState` for a missing record, `UnknownStateType` for a record
    /// without payload, otherwise whatever applying the record returned.
    pub async fn handle_state(&self, state: Option<&State>) -> Result<u64> {
        self.core.handle_state(state).await
    }

    /// Converge one deployment and report its instances.
    ///
    /// # Errors
    ///
    /// Validation, cluster, and control-plane failures.
    pub async fn apply_deployment(&self, request: &ApplyDeployment) -> Result<()> {
        deployment::apply(&self.core, request).await
    }

    /// Remove one deployment; absence counts as success.
    ///
    /// # Errors
    ///
    /// Validation, cluster, and control-plane failures.
    pub async fn delete_deployment(&self, request: &DeleteDeployment) -> Result<()> {
        deployment::delete(&self.core, request).await
    }

    /// Converge one sentinel and report its availability.
    ///
    /// # Errors
    ///
    /// Validation, cluster, and control-plane failures.
    pub async fn apply_sentinel(&self, request: &ApplySentinel) -> Result<()> {
        sentinel::apply(&self.core, request).await
    }

    /// Remove one sentinel's service and deployment; absence counts as
    /// success.
    ///
    /// # Errors
    ///
    /// Validation, cluster, and control-plane failures.
    pub async fn delete_sentinel(&self, request: &DeleteSentinel) -> Result<()> {
        sentinel::delete(&self.core, request).await
    }

    /// Run a single refresh pass for `component`, returning how many
    /// managed objects were visited.
    ///
    /// # Errors
    ///
    /// Only a failed list call; per-object failures are logged.
    pub async fn refresh(&self, component: Component) -> Result<usize> {
        refresh::refresh(&self.core, component).await
    }

    /// Processed and committed sync watermarks.
    #[must_use]
    pub fn cursor(&self) -> &ResumeCursor {
        &self.core.cursor
    }

    /// State of the breaker guarding control-plane writes.
    #[must_use]
    pub fn breaker_state(&self) -> CircuitState {
        self.core.breaker.state()
    }

    #[must_use]
    pub fn config(&self) -> &ReconcilerConfig {
        &self.core.config
    }

    fn notify(&self, transition: Transition) {
        if let Some(hook) = &self.hook {
            notify_detached(
                Arc::clone(hook),
                transition,
                self.core.config.instance_id.clone(),
                self.core.config.notify_timeout(),
            );
        }
    }
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("instance_id", &self.core.config.instance_id)
            .field("cursor", &self.core.cursor)
            .field("breaker", &self.core.breaker)
            .finish_non_exhaustive()
    }
}

/// Builder for creating a reconciler.
#[derive(Default)]
pub struct ReconcilerBuilder {
    config: Option<ReconcilerConfig>,
    cluster: Option<Arc<dyn ClusterApi>>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    hook: Option<Arc<dyn LifecycleHook>>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<dyn BreakerMetrics>>,
    initial_sequence: u64,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the cluster.
    #[must_use]
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterApi>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Set the control-plane client.
    #[must_use]
    pub fn with_control_plane(mut self, control_plane: Arc<dyn ControlPlane>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    /// Receive start and stop notifications.
    #[must_use]
    pub fn with_lifecycle_hook(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Time source for the circuit breaker.
    #[must_use]
    pub fn with_breaker_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Per-call breaker metrics sink; defaults to `trace` events.
    #[must_use]
    pub fn with_breaker_metrics(mut self, metrics: Arc<dyn BreakerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Resume the sync stream from `sequence` instead of bootstrapping.
    #[must_use]
    pub const fn resume_from(mut self, sequence: u64) -> Self {
        self.initial_sequence = sequence;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the configuration fails validation or
    /// the cluster or control plane is missing.
    pub fn build(self) -> Result<Reconciler> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let cluster = self
            .cluster
            .ok_or_else(|| Error::invalid_config("a cluster is required"))?;
        let control_plane = self
            .control_plane
            .ok_or_else(|| Error::invalid_config("a control plane client is required"))?;

        let settings = &config.breaker;
        let mut breaker = BreakerConfig::new(settings.name.clone())
            .with_max_requests(settings.max_requests)
            .with_cyclic_period(settings.cyclic_period())
            .with_trip_threshold(settings.trip_threshold)
            .with_timeout(settings.timeout())
            .with_classifier(ControlPlaneError::is_outage);
        if let Some(clock) = self.clock {
            breaker = breaker.with_clock(clock);
        }
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(TracingMetrics) as Arc<dyn BreakerMetrics>);
        breaker = breaker.with_metrics(metrics);

        Ok(Reconciler {
            core: Arc::new(Core {
                breaker: CircuitBreaker::new(breaker),
                cursor: ResumeCursor::starting_at(self.initial_sequence),
                config,
                cluster,
                control_plane,
            }),
            hook: self.hook,
            phase: Mutex::new(Phase::Idle),
        })
    }
}
