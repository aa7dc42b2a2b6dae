//! Logging combinators for `Result`.
//!
//! Loops that must survive a single failure turn the error into a log line
//! and carry on.

use std::fmt::Display;

/// Extension trait providing logged conversions for any `Result`.
pub trait ResultExt<T> {
    /// Convert to an `Option`, logging the error at `warn` with `context`.
    fn warn_on_err(self, context: &str) -> Option<T>;
}

impl<T, E: Display> ResultExt<T> for std::result::Result<T, E> {
    fn warn_on_err(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "{context}");
                None
            }
        }
    }
}
