#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # moor
//!
//! Keeps a control plane's desired workloads and sentinels reconciled with
//! a Kubernetes cluster.
//!
//! This library re-exports the moor workspace crates for convenience.

pub use moor_breaker;
pub use moor_core;
pub use moor_reconciler;

pub mod telemetry;

pub use moor_core::ReconcilerConfig;
pub use moor_reconciler::{Error, Reconciler, ReconcilerBuilder, Result};
pub use telemetry::{TelemetryError, init_tracing};
