//! Shared building blocks for the moor reconciler.
//!
//! - [`config`]: the reconciler configuration model, loaded from TOML
//! - [`error`]: configuration errors
//! - [`result`]: logging combinators used by the long-running loops

pub mod config;
pub mod error;
pub mod result;

pub use config::{BreakerSettings, ReconcilerConfig, RefreshSettings, SyncSettings};
pub use error::{Error, Result};
pub use result::ResultExt;
