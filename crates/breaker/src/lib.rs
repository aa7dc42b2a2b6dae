//! Circuit breaker pattern implementation.
//!
//! Prevents cascading failures by failing fast while a downstream dependency
//! is unhealthy. The breaker moves between three states:
//!
//! - **Closed**: normal operation, calls pass through and failures are
//!   counted in a cyclic window
//! - **Open**: the circuit is tripped, calls fail immediately
//! - **Half-Open**: a limited number of probe calls test recovery
//!
//! # Example
//!
//! ```ignore
//! use moor_breaker::{BreakerConfig, CircuitBreaker};
//!
//! let breaker: CircuitBreaker<std::io::Error> =
//!     CircuitBreaker::new(BreakerConfig::new("control-plane"));
//!
//! let value = breaker.call(|| async { Ok::<_, std::io::Error>(42) }).await?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;

pub use breaker::{CircuitBreaker, CircuitState, Counts};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BreakerConfig, Classifier};
pub use error::BreakerError;
pub use metrics::{BreakerMetrics, TracingMetrics};
