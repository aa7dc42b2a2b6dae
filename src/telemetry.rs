//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Telemetry initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log directive: {reason}")]
    InvalidDirective { reason: String },

    #[error("global subscriber already installed: {reason}")]
    AlreadyInstalled { reason: String },
}

/// Build the filter: `RUST_LOG` when set, otherwise `default_directive`.
///
/// # Errors
///
/// Returns `InvalidDirective` when `default_directive` does not parse and
/// `RUST_LOG` is unset.
pub fn env_filter(default_directive: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(default_directive).map_err(|e| TelemetryError::InvalidDirective {
            reason: e.to_string(),
        })
    })
}

/// Install a fmt subscriber filtered by [`env_filter`].
///
/// # Errors
///
/// Returns `AlreadyInstalled` when a global subscriber is already set.
pub fn init_tracing(default_directive: &str) -> Result<(), TelemetryError> {
    tracing_subscriber::registry()
        .with(env_filter(default_directive)?)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled {
            reason: e.to_string(),
        })
}
