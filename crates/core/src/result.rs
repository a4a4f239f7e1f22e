//! Result alias and combinators used across the engine.

use crate::error::Error;
use crate::types::CorrelationId;

/// The standard Result type for stagewise operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait for attaching stream context and observing failures.
pub trait ResultExt<T> {
    /// Tag an error with the stream it happened on.
    ///
    /// Errors already carrying a stream are left untouched.
    ///
    /// # Errors
    ///
    /// Returns the original error wrapped in [`Error::Stream`].
    fn with_stream(self, correlation_id: &CorrelationId) -> Result<T>;

    /// Inspect the error without consuming the Result.
    ///
    /// # Errors
    ///
    /// Returns the original error unchanged.
    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_stream(self, correlation_id: &CorrelationId) -> Result<T> {
        self.map_err(|e| match e {
            Error::Stream { .. } => e,
            other => Error::Stream {
                correlation_id: correlation_id.to_string(),
                source: Box::new(other),
            },
        })
    }

    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}
