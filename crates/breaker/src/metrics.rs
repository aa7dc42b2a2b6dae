//! Metrics sink for breaker decisions.

use std::fmt;

use crate::breaker::CircuitState;

/// Receives one `(name, state)` sample per admitted or rejected call.
pub trait BreakerMetrics: Send + Sync + fmt::Debug {
    fn record_request(&self, name: &str, state: CircuitState);
}

/// Sink that emits each sample as a `trace` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl BreakerMetrics for TracingMetrics {
    fn record_request(&self, name: &str, state: CircuitState) {
        tracing::trace!(circuit = name, state = %state, "circuit breaker request");
    }
}
