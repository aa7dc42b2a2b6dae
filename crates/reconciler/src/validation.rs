//! Field checks run before any cluster call.

use std::fmt;

use itertools::Itertools;

use crate::types::{ApplyDeployment, ApplySentinel, DeleteDeployment, DeleteSentinel};

const MAX_LABEL_LEN: usize = 63;

const KNOWN_SIGNALS: &[&str] = &[
    "SIGTERM", "SIGINT", "SIGQUIT", "SIGHUP", "SIGUSR1", "SIGUSR2", "SIGKILL",
];

/// One rejected field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub reason: String,
}

/// Every field rejected in one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    #[must_use]
    pub fn fields(&self) -> &[FieldError] {
        &self.0
    }

    /// Whether `field` was rejected.
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.0.iter().any(|error| error.field == field)
    }

    fn push(&mut self, field: &'static str, reason: impl Into<String>) {
        self.0.push(FieldError {
            field,
            reason: reason.into(),
        });
    }

    fn required(&mut self, field: &'static str, value: &str) {
        if value.trim().is_empty() {
            self.push(field, "is required");
        }
    }

    fn dns_label(&mut self, field: &'static str, value: &str) {
        if value.is_empty() {
            self.push(field, "is required");
        } else if !is_dns_label(value) {
            self.push(
                field,
                format!("'{value}' is not a lowercase RFC 1123 label of at most {MAX_LABEL_LEN} characters"),
            );
        }
    }

    fn into_result(self) -> Result<(), Self> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .0
            .iter()
            .map(|error| format!("{} {}", error.field, error.reason))
            .join("; ");
        f.write_str(&rendered)
    }
}

impl std::error::Error for ValidationErrors {}

fn is_dns_label(value: &str) -> bool {
    value.len() <= MAX_LABEL_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}

fn resources(errors: &mut ValidationErrors, replicas: i32, cpu_millicores: i64, memory_mib: i64) {
    if replicas < 0 {
        errors.push("replicas", "must not be negative");
    }
    if cpu_millicores <= 0 {
        errors.push("cpu_millicores", "must be positive");
    }
    if memory_mib <= 0 {
        errors.push("memory_mib", "must be positive");
    }
}

/// Check an apply request for a deployment.
///
/// # Errors
///
/// Returns every rejected field.
pub fn apply_deployment(request: &ApplyDeployment) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    errors.required("workspace_id", &request.workspace_id);
    errors.required("project_id", &request.project_id);
    errors.required("environment_id", &request.environment_id);
    errors.required("deployment_id", &request.deployment_id);
    errors.dns_label("k8s_namespace", &request.k8s_namespace);
    errors.dns_label("k8s_name", &request.k8s_name);
    errors.required("image", &request.image);
    resources(
        &mut errors,
        request.replicas,
        request.cpu_millicores,
        request.memory_mib,
    );

    if let Some(check) = &request.healthcheck {
        if !check.path.starts_with('/') {
            errors.push("healthcheck.path", "must start with '/'");
        }
        if check.port.is_some_and(|port| !(1..=65_535).contains(&port)) {
            errors.push("healthcheck.port", "must be between 1 and 65535");
        }
        if check.interval_secs <= 0 || check.timeout_secs <= 0 || check.failure_threshold <= 0 {
            errors.push(
                "healthcheck",
                "interval, timeout and failure threshold must be positive",
            );
        }
    }

    if let Some(signal) = &request.shutdown_signal {
        if !KNOWN_SIGNALS.contains(&signal.as_str()) {
            errors.push("shutdown_signal", format!("'{signal}' is not a known signal"));
        }
    }

    errors.into_result()
}

/// Check a delete request for a deployment.
///
/// # Errors
///
/// Returns every rejected field.
pub fn delete_deployment(request: &DeleteDeployment) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    errors.required("k8s_namespace", &request.k8s_namespace);
    errors.required("k8s_name", &request.k8s_name);
    errors.into_result()
}

/// Check an apply request for a sentinel.
///
/// # Errors
///
/// Returns every rejected field.
pub fn apply_sentinel(request: &ApplySentinel) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    errors.required("workspace_id", &request.workspace_id);
    errors.required("project_id", &request.project_id);
    errors.required("environment_id", &request.environment_id);
    errors.required("sentinel_id", &request.sentinel_id);
    errors.dns_label("k8s_namespace", &request.k8s_namespace);
    errors.dns_label("k8s_name", &request.k8s_name);
    errors.required("image", &request.image);
    resources(
        &mut errors,
        request.replicas,
        request.cpu_millicores,
        request.memory_mib,
    );
    errors.into_result()
}

/// Check a delete request for a sentinel.
///
/// # Errors
///
/// Returns every rejected field.
pub fn delete_sentinel(request: &DeleteSentinel) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    errors.required("k8s_namespace", &request.k8s_namespace);
    errors.required("k8s_name", &request.k8s_name);
    errors.into_result()
}
