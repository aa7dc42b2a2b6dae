//! Label keys and selectors identifying managed objects.

use std::collections::BTreeMap;
use std::fmt;

use itertools::Itertools;

pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const COMPONENT: &str = "app.kubernetes.io/component";
pub const WORKSPACE_ID: &str = "moor.dev/workspace-id";
pub const PROJECT_ID: &str = "moor.dev/project-id";
pub const ENVIRONMENT_ID: &str = "moor.dev/environment-id";
pub const DEPLOYMENT_ID: &str = "moor.dev/deployment-id";
pub const SENTINEL_ID: &str = "moor.dev/sentinel-id";
pub const BUILD_ID: &str = "moor.dev/build-id";

/// Kind of managed object, carried in the component label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Deployment,
    Sentinel,
}

impl Component {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::Sentinel => "sentinel",
        }
    }

    /// Label key holding this component's control-plane id.
    #[must_use]
    pub const fn id_label(self) -> &'static str {
        match self {
            Self::Deployment => DEPLOYMENT_ID,
            Self::Sentinel => SENTINEL_ID,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Selector matching every object of `component` owned by `manager`.
    #[must_use]
    pub fn managed(manager: &str, component: Component) -> Self {
        Self::new()
            .with(MANAGED_BY, manager)
            .with(COMPONENT, component.as_str())
    }

    /// Add an equality requirement.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Whether `labels` satisfy every requirement.
    #[must_use]
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.0.iter().all(|(key, value)| {
            labels
                .and_then(|labels| labels.get(key))
                .is_some_and(|actual| actual == value)
        })
    }

    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    #[must_use]
    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl From<BTreeMap<String, String>> for Selector {
    fn from(labels: BTreeMap<String, String>) -> Self {
        Self(labels)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .0
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .join(",");
        f.write_str(&rendered)
    }
}
