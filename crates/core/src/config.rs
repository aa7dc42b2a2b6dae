//! Reconciler configuration.
//!
//! Every section carries defaults, so an empty TOML document is a valid
//! configuration. Durations are stored as plain integers (`*_ms`, `*_secs`)
//! and exposed as [`Duration`] through accessor methods.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_INSTANCE_ID: &str = "moor";
const DEFAULT_REGION: &str = "local";
const DEFAULT_FIELD_MANAGER: &str = "moor";
const DEFAULT_SENTINEL_NAMESPACE: &str = "sentinel";
const DEFAULT_NOTIFY_TIMEOUT_MS: u64 = 5_000;

/// Top-level reconciler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Identity of this reconciler instance, attached to every log line.
    pub instance_id: String,
    /// Region requested from the control plane's sync stream.
    pub region: String,
    /// Field owner used for server-side apply.
    pub field_manager: String,
    /// Namespace hosting sentinels; exempt from network isolation.
    pub sentinel_namespace: String,
    /// Upper bound for detached lifecycle notifications.
    pub notify_timeout_ms: u64,
    /// Sync watcher reconnect behaviour.
    pub sync: SyncSettings,
    /// Refresh loop behaviour.
    pub refresh: RefreshSettings,
    /// Circuit breaker guarding control-plane writes.
    pub breaker: BreakerSettings,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            instance_id: DEFAULT_INSTANCE_ID.to_string(),
            region: DEFAULT_REGION.to_string(),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            sentinel_namespace: DEFAULT_SENTINEL_NAMESPACE.to_string(),
            notify_timeout_ms: DEFAULT_NOTIFY_TIMEOUT_MS,
            sync: SyncSettings::default(),
            refresh: RefreshSettings::default(),
            breaker: BreakerSettings::default(),
        }
    }
}

impl ReconcilerConfig {
    /// Parse a configuration from a TOML document and validate it.
    ///
    /// # Errors
    ///
    /// Returns `TomlParseFailed` for malformed input and `InvalidConfig`
    /// when a value is out of range.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| Error::toml_parse_failed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` when the file cannot be read, otherwise the
    /// errors of [`ReconcilerConfig::from_toml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
        Self::from_toml_str(&contents)
    }

    /// Check every value against its domain.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if self.instance_id.trim().is_empty() {
            return Err(Error::invalid_config("instance_id must not be empty"));
        }
        if self.region.trim().is_empty() {
            return Err(Error::invalid_config("region must not be empty"));
        }
        if self.field_manager.trim().is_empty() {
            return Err(Error::invalid_config("field_manager must not be empty"));
        }
        if self.sentinel_namespace.trim().is_empty() {
            return Err(Error::invalid_config(
                "sentinel_namespace must not be empty",
            ));
        }
        self.sync.validate()?;
        self.refresh.validate()?;
        self.breaker.validate()
    }

    /// Bound for detached lifecycle notifications.
    #[must_use]
    pub const fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }
}

/// Jittered reconnect window for the sync stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Jitter floor before each stream attempt.
    pub min_backoff_ms: u64,
    /// Jitter ceiling before each stream attempt.
    pub max_backoff_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            min_backoff_ms: 1_000,
            max_backoff_ms: 5_000,
        }
    }
}

impl SyncSettings {
    fn validate(&self) -> Result<()> {
        if self.max_backoff_ms == 0 {
            return Err(Error::invalid_config("sync.max_backoff_ms must be > 0"));
        }
        if self.min_backoff_ms > self.max_backoff_ms {
            return Err(Error::invalid_config(format!(
                "sync.min_backoff_ms ({}) exceeds sync.max_backoff_ms ({})",
                self.min_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Periodic full-reconciliation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    /// Seconds between two refresh passes.
    pub interval_secs: u64,
    /// Objects requested per list page.
    pub page_size: u32,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            page_size: 100,
        }
    }
}

impl RefreshSettings {
    fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(Error::invalid_config("refresh.interval_secs must be > 0"));
        }
        if self.page_size == 0 {
            return Err(Error::invalid_config("refresh.page_size must be > 0"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Circuit breaker tuning for control-plane writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Circuit name, used as the metrics label.
    pub name: String,
    /// Probe calls admitted while half-open.
    pub max_requests: u32,
    /// Window after which closed-state counters reset.
    pub cyclic_period_ms: u64,
    /// Failures within one window that trip the circuit.
    pub trip_threshold: u32,
    /// Time the circuit stays open before probing.
    pub timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            name: "control-plane".to_string(),
            max_requests: 10,
            cyclic_period_ms: 5_000,
            trip_threshold: 5,
            timeout_ms: 60_000,
        }
    }
}

impl BreakerSettings {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_config("breaker.name must not be empty"));
        }
        if self.max_requests == 0 {
            return Err(Error::invalid_config("breaker.max_requests must be > 0"));
        }
        if self.trip_threshold == 0 {
            return Err(Error::invalid_config("breaker.trip_threshold must be > 0"));
        }
        if self.cyclic_period_ms == 0 {
            return Err(Error::invalid_config(
                "breaker.cyclic_period_ms must be > 0",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn cyclic_period(&self) -> Duration {
        Duration::from_millis(self.cyclic_period_ms)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
