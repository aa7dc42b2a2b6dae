//! Error types for breaker-wrapped calls.

use thiserror::Error;

/// Outcome of a call rejected by, or failing through, the breaker.
///
/// The three variants are distinguishable so callers can tell a tripped
/// circuit from an exhausted probe budget from the wrapped call's own error.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the call was not attempted.
    #[error("circuit '{name}' is open")]
    Tripped { name: String },

    /// The circuit is half-open and its probe budget is spent.
    #[error("circuit '{name}' is half-open and rejected the request: too many requests")]
    TooManyRequests { name: String },

    /// The wrapped call ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Whether the call was rejected because the circuit is open.
    #[must_use]
    pub const fn is_tripped(&self) -> bool {
        matches!(self, Self::Tripped { .. })
    }

    /// Whether the call was rejected by the half-open probe limit.
    #[must_use]
    pub const fn is_too_many_requests(&self) -> bool {
        matches!(self, Self::TooManyRequests { .. })
    }

    /// Whether the breaker rejected the call without running it.
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        !matches!(self, Self::Inner(_))
    }

    /// The wrapped call's error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Tripped { .. } | Self::TooManyRequests { .. } => None,
        }
    }
}
