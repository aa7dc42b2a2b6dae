//! Circuit breaker configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::metrics::BreakerMetrics;

/// Default circuit breaker configuration.
const DEFAULT_MAX_REQUESTS: u32 = 10;
const DEFAULT_CYCLIC_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_TRIP_THRESHOLD: u32 = 5;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Decides whether an error counts as a downstream failure.
pub type Classifier<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Circuit breaker configuration.
pub struct BreakerConfig<E> {
    /// Circuit name, reported to the metrics sink and in errors.
    pub name: String,
    /// Probe calls admitted while half-open; also the consecutive
    /// successes needed to close again.
    pub max_requests: u32,
    /// Window after which closed-state counters reset.
    pub cyclic_period: Duration,
    /// Failures within one window that trip the circuit.
    pub trip_threshold: u32,
    /// Time spent open before probing.
    pub timeout: Duration,
    /// Failure classifier; every error counts by default.
    pub classifier: Classifier<E>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Optional per-call metrics sink.
    pub metrics: Option<Arc<dyn BreakerMetrics>>,
}

impl<E: 'static> BreakerConfig<E> {
    /// Create a config with default thresholds.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_requests: DEFAULT_MAX_REQUESTS,
            cyclic_period: DEFAULT_CYCLIC_PERIOD,
            trip_threshold: DEFAULT_TRIP_THRESHOLD,
            timeout: DEFAULT_TIMEOUT,
            classifier: Arc::new(|_: &E| true),
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    /// Set the half-open probe budget.
    #[must_use]
    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Set the counter window.
    #[must_use]
    pub fn with_cyclic_period(mut self, period: Duration) -> Self {
        self.cyclic_period = period;
        self
    }

    /// Set the number of failures that trips the circuit.
    #[must_use]
    pub fn with_trip_threshold(mut self, threshold: u32) -> Self {
        self.trip_threshold = threshold;
        self
    }

    /// Set how long the circuit stays open.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the failure classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach a metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn BreakerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl<E> Clone for BreakerConfig<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            max_requests: self.max_requests,
            cyclic_period: self.cyclic_period,
            trip_threshold: self.trip_threshold,
            timeout: self.timeout,
            classifier: Arc::clone(&self.classifier),
            clock: Arc::clone(&self.clock),
            metrics: self.metrics.clone(),
        }
    }
}

impl<E> fmt::Debug for BreakerConfig<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerConfig")
            .field("name", &self.name)
            .field("max_requests", &self.max_requests)
            .field("cyclic_period", &self.cyclic_period)
            .field("trip_threshold", &self.trip_threshold)
            .field("timeout", &self.timeout)
            .field("clock", &self.clock)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}
