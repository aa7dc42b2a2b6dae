//! Fire-and-forget notifications about reconciler start and stop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

/// Receives start and stop notifications. Calls are detached from the
/// reconciler's own lifecycle and bounded by `notify_timeout_ms`.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn on_start(&self, instance_id: &str) -> anyhow::Result<()>;

    async fn on_stop(&self, instance_id: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Start,
    Stop,
}

impl Transition {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

/// Spawn the notification without awaiting it. Outside a runtime the
/// notification is dropped.
pub(crate) fn notify_detached(
    hook: Arc<dyn LifecycleHook>,
    transition: Transition,
    instance_id: String,
    timeout: Duration,
) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(transition = transition.as_str(), "no runtime, lifecycle notification dropped");
        return;
    };

    runtime.spawn(async move {
        let call = async {
            match transition {
                Transition::Start => hook.on_start(&instance_id).await,
                Transition::Stop => hook.on_stop(&instance_id).await,
            }
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(())) => debug!(transition = transition.as_str(), "lifecycle notification sent"),
            Ok(Err(err)) => warn!(
                transition = transition.as_str(),
                error = %err,
                "lifecycle notification failed"
            ),
            Err(_) => warn!(
                transition = transition.as_str(),
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "lifecycle notification timed out"
            ),
        }
    });
}
