//! The three-state circuit breaker.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::error::BreakerError;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed - normal operation
    Closed,
    /// Circuit is open - rejecting requests
    Open,
    /// Circuit is half-open - testing recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Rolling request counters for the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub successes: u32,
    pub failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_success(&mut self) {
        self.successes = self.successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    counts: Counts,
    reset_counters_at: Instant,
    reset_state_at: Instant,
}

/// Circuit breaker protecting calls that fail with `E`.
///
/// Every read and mutation of the state happens under one lock, so a single
/// instance can be shared by any number of concurrent callers.
pub struct CircuitBreaker<E> {
    config: BreakerConfig<E>,
    inner: Mutex<Inner>,
}

impl<E> CircuitBreaker<E> {
    /// Create a closed breaker.
    pub fn new(config: BreakerConfig<E>) -> Self {
        let now = config.clock.now();
        let inner = Inner {
            state: CircuitState::Closed,
            counts: Counts::default(),
            reset_counters_at: now + config.cyclic_period,
            reset_state_at: now,
        };
        Self {
            config,
            inner: Mutex::new(inner),
        }
    }

    /// Circuit name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get current circuit state.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Snapshot of the current window's counters.
    pub fn counts(&self) -> Counts {
        self.lock().counts
    }

    /// Execute `f` if the circuit permits it.
    ///
    /// # Errors
    ///
    /// Returns `Tripped` while the circuit is open, `TooManyRequests` when
    /// the half-open probe budget is spent, and `Inner` with `f`'s own error
    /// when the call ran and failed.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.preflight()?;
        let result = f().await;
        self.postflight(result.as_ref().err());
        result.map_err(BreakerError::Inner)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a call may run, advancing time-based transitions.
    fn preflight(&self) -> Result<(), BreakerError<E>> {
        let now = self.config.clock.now();
        let mut inner = self.lock();

        if inner.state == CircuitState::Open && now >= inner.reset_state_at {
            info!(circuit = %self.config.name, "circuit breaker transitioning to half-open after timeout");
            self.transition(&mut inner, CircuitState::HalfOpen, now);
        }

        if inner.state == CircuitState::Closed && now >= inner.reset_counters_at {
            inner.counts = Counts::default();
            inner.reset_counters_at = now + self.config.cyclic_period;
        }

        if let Some(metrics) = &self.config.metrics {
            metrics.record_request(&self.config.name, inner.state);
        }

        match inner.state {
            CircuitState::Open => {
                debug!(circuit = %self.config.name, "circuit open, rejecting request");
                Err(BreakerError::Tripped {
                    name: self.config.name.clone(),
                })
            }
            CircuitState::HalfOpen if inner.counts.requests >= self.config.max_requests => {
                debug!(circuit = %self.config.name, "half-open probe budget exhausted");
                Err(BreakerError::TooManyRequests {
                    name: self.config.name.clone(),
                })
            }
            CircuitState::Closed | CircuitState::HalfOpen => {
                inner.counts.requests = inner.counts.requests.saturating_add(1);
                Ok(())
            }
        }
    }

    /// Record the outcome of an admitted call.
    fn postflight(&self, error: Option<&E>) {
        let now = self.config.clock.now();
        let mut inner = self.lock();

        let failed = error.is_some_and(|e| (self.config.classifier)(e));
        if failed {
            inner.counts.on_failure();
        } else {
            inner.counts.on_success();
        }

        match inner.state {
            CircuitState::Closed => {
                if failed && inner.counts.failures >= self.config.trip_threshold {
                    warn!(
                        circuit = %self.config.name,
                        failures = inner.counts.failures,
                        "circuit breaker opening due to failures"
                    );
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                if failed {
                    warn!(circuit = %self.config.name, "circuit breaker re-opening after half-open failure");
                    self.transition(&mut inner, CircuitState::Open, now);
                } else if inner.counts.consecutive_successes >= self.config.max_requests {
                    info!(
                        circuit = %self.config.name,
                        successes = inner.counts.consecutive_successes,
                        "circuit breaker closing after successful recovery"
                    );
                    self.transition(&mut inner, CircuitState::Closed, now);
                }
            }
            // A call admitted before the circuit tripped finished late.
            CircuitState::Open => {}
        }
    }

    /// Move to `next`, resetting counters and re-arming deadlines.
    fn transition(&self, inner: &mut Inner, next: CircuitState, now: Instant) {
        inner.state = next;
        inner.counts = Counts::default();
        match next {
            CircuitState::Closed => {
                inner.reset_counters_at = now + self.config.cyclic_period;
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                inner.reset_state_at = now + self.config.timeout;
            }
        }
    }
}

impl<E> fmt::Debug for CircuitBreaker<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("inner", &*self.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::BreakerMetrics;

    fn breaker(clock: &Arc<ManualClock>) -> CircuitBreaker<&'static str> {
        CircuitBreaker::new(
            BreakerConfig::new("test")
                .with_trip_threshold(3)
                .with_max_requests(2)
                .with_timeout(Duration::from_secs(60))
                .with_cyclic_period(Duration::from_secs(5))
                .with_clock(clock.clone()),
        )
    }

    async fn fail(b: &CircuitBreaker<&'static str>) -> Result<(), BreakerError<&'static str>> {
        b.call(|| async { Err::<(), _>("downstream failed") }).await
    }

    async fn succeed(b: &CircuitBreaker<&'static str>) -> Result<u8, BreakerError<&'static str>> {
        b.call(|| async { Ok::<_, &'static str>(1) }).await
    }

    async fn trip(b: &CircuitBreaker<&'static str>) {
        for _ in 0..3 {
            let _ = fail(b).await;
        }
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_default_is_closed() {
        let clock = Arc::new(ManualClock::new());
        let b = breaker(&clock);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(succeed(&b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_inner_error_is_passed_through() {
        let clock = Arc::new(ManualClock::new());
        let b = breaker(&clock);
        let err = fail(&b).await.unwrap_err();
        assert!(matches!(err, BreakerError::Inner("downstream failed")));
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_trips_after_threshold_and_rejects_without_calling() {
        let clock = Arc::new(ManualClock::new());
        let b = breaker(&clock);
        trip(&b).await;

        let invoked = AtomicU32::new(0);
        let result = b
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;

        assert!(result.unwrap_err().is_tripped());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_window_reset_forgets_old_failures() {
        let clock = Arc::new(ManualClock::new());
        let b = breaker(&clock);

        let _ = fail(&b).await;
        let _ = fail(&b).await;
        clock.advance(Duration::from_secs(6));
        let _ = fail(&b).await;

        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.counts().failures, 1);
    }

    #[tokio::test]
    async fn test_successes_do_not_reset_window_failures() {
        let clock = Arc::new(ManualClock::new());
        let b = breaker(&clock);

        let _ = fail(&b).await;
        let _ = succeed(&b).await;
        let _ = fail(&b).await;
        let _ = succeed(&b).await;
        let _ = fail(&b).await;

        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_after_timeout() {
        let clock = Arc::new(ManualClock::new());
        let b = breaker(&clock);
        trip(&b).await;

        clock.advance(Duration::from_secs(59));
        assert!(succeed(&b).await.unwrap_err().is_tripped());

        clock.advance(Duration::from_secs(1));
        assert_eq!(succeed(&b).await.unwrap(), 1);
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_with_fresh_timeout() {
        let clock = Arc::new(ManualClock::new());
        let b = breaker(&clock);
        trip(&b).await;

        clock.advance(Duration::from_secs(60));
        assert!(matches!(fail(&b).await, Err(BreakerError::Inner(_))));
        assert_eq!(b.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(30));
        assert!(succeed(&b).await.unwrap_err().is_tripped());

        clock.advance(Duration::from_secs(30));
        assert!(succeed(&b).await.is_ok());
    }

    #[tokio::test]
    async fn test_half_open_closes_after_max_requests_successes() {
        let clock = Arc::new(ManualClock::new());
        let b = breaker(&clock);
        trip(&b).await;
        clock.advance(Duration::from_secs(60));

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();

        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.counts(), Counts::default());
    }

    #[tokio::test]
    async fn test_half_open_probe_budget() {
        let clock = Arc::new(ManualClock::new());
        let b = Arc::new(breaker(&clock));
        trip(&b).await;
        clock.advance(Duration::from_secs(60));

        // Two probes in flight exhaust the budget of a third caller.
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let mut probes = Vec::new();
        for _ in 0..2 {
            let b = Arc::clone(&b);
            let mut rx = release_rx.clone();
            probes.push(tokio::spawn(async move {
                b.call(|| async move {
                    let _ = rx.wait_for(|released| *released).await;
                    Ok::<_, &'static str>(())
                })
                .await
            }));
        }
        while b.counts().requests < 2 {
            tokio::task::yield_now().await;
        }

        assert!(succeed(&b).await.unwrap_err().is_too_many_requests());

        release_tx.send(true).unwrap();
        for probe in probes {
            probe.await.unwrap().unwrap();
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_classifier_ignores_expected_errors() {
        let clock = Arc::new(ManualClock::new());
        let b: CircuitBreaker<u16> = CircuitBreaker::new(
            BreakerConfig::new("classified")
                .with_trip_threshold(1)
                .with_classifier(|code| *code >= 500)
                .with_clock(clock.clone()),
        );

        let not_found = b.call(|| async { Err::<(), _>(404) }).await;
        assert!(matches!(not_found, Err(BreakerError::Inner(404))));
        assert_eq!(b.state(), CircuitState::Closed);

        let _ = b.call(|| async { Err::<(), _>(503) }).await;
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[derive(Debug, Default)]
    struct RecordingMetrics {
        samples: Mutex<Vec<(String, CircuitState)>>,
    }

    impl BreakerMetrics for RecordingMetrics {
        fn record_request(&self, name: &str, state: CircuitState) {
            self.samples.lock().unwrap().push((name.to_string(), state));
        }
    }

    #[tokio::test]
    async fn test_metrics_sink_sees_admitted_and_rejected_calls() {
        let clock = Arc::new(ManualClock::new());
        let metrics = Arc::new(RecordingMetrics::default());
        let b: CircuitBreaker<&'static str> = CircuitBreaker::new(
            BreakerConfig::new("metered")
                .with_trip_threshold(1)
                .with_clock(clock.clone())
                .with_metrics(metrics.clone()),
        );

        let _ = b.call(|| async { Err::<(), _>("boom") }).await;
        let _ = b.call(|| async { Ok::<_, &'static str>(()) }).await;

        let samples = metrics.samples.lock().unwrap().clone();
        assert_eq!(
            samples,
            vec![
                ("metered".to_string(), CircuitState::Closed),
                ("metered".to_string(), CircuitState::Open),
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_stays_closed_below_threshold(outcomes in proptest::collection::vec(any::<bool>(), 0..64)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let clock = Arc::new(ManualClock::new());
            let b: CircuitBreaker<()> = CircuitBreaker::new(
                BreakerConfig::new("prop")
                    .with_trip_threshold(5)
                    .with_clock(clock.clone()),
            );

            let mut failures = 0u32;
            for ok in outcomes {
                let result = runtime.block_on(b.call(|| async move { if ok { Ok(()) } else { Err(()) } }));
                if !ok {
                    failures += 1;
                }
                if failures < 5 {
                    prop_assert_eq!(b.state(), CircuitState::Closed);
                    prop_assert!(!matches!(result, Err(BreakerError::Tripped { .. })), "breaker unexpectedly tripped");
                } else {
                    prop_assert_eq!(b.state(), CircuitState::Open);
                }
            }
        }
    }
}
