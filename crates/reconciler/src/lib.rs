//! Keeps a Kubernetes cluster converged on the desired state published by
//! a remote control plane.
//!
//! Desired state arrives as a stream of sequenced records. Each record is
//! applied idempotently with server-side apply, and the resulting actual
//! state is reported back to the control plane.
//!
//! # Loops
//!
//! A started [`Reconciler`] runs five tasks:
//!
//! - **Sync watcher**: consumes the desired-state stream, resuming from the
//!   committed [`ResumeCursor`].
//! - **Watch loops**: one per managed kind (workload replica sets and
//!   sentinel deployments), reporting every observed change.
//! - **Refresh loops**: one per managed kind, periodically re-fetching the
//!   desired state of every managed object to repair drift.
//!
//! Every state report goes through a circuit breaker, so an unhealthy
//! control plane is not hammered by the loops.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use moor_reconciler::{KubeCluster, Reconciler};
//!
//! let cluster = Arc::new(KubeCluster::try_default().await?);
//! let reconciler = Reconciler::builder()
//!     .with_config(config)
//!     .with_cluster(cluster)
//!     .with_control_plane(control_plane)
//!     .build()?;
//!
//! reconciler.start().await?;
//! // ...
//! reconciler.stop().await?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cluster;
pub mod control_plane;
pub mod cursor;
pub mod error;
pub mod labels;
pub mod types;
pub mod validation;

mod deployment;
mod lifecycle;
mod namespace;
mod reconciler;
mod refresh;
mod sentinel;
mod status;
mod sync;
mod watch;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use cluster::{
    ClusterApi, ClusterError, KubeCluster, ListPage, PageRequest, WatchEvent, WatchStream,
};
pub use control_plane::{ControlPlane, ControlPlaneError, StateStream, SyncRequest};
pub use cursor::ResumeCursor;
pub use deployment::{WORKLOAD_PORT, build_replica_set};
pub use error::{Error, Result};
pub use labels::{Component, Selector};
pub use lifecycle::LifecycleHook;
pub use namespace::ISOLATION_POLICY_NAME;
pub use reconciler::{Reconciler, ReconcilerBuilder};
pub use sentinel::{SENTINEL_PORT, build_deployment, build_service};
pub use status::{instance_address, instance_for_pod, instance_status, pod_dns_name};
pub use types::{
    ApplyDeployment, ApplySentinel, Bookmark, DeleteDeployment, DeleteSentinel,
    DeploymentState, DeploymentStateReport, Healthcheck, Instance, InstanceStatus,
    SentinelState, SentinelStateReport, State, StateKind,
};
pub use validation::{FieldError, ValidationErrors};
