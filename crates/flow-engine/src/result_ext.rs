//! Result extension trait for logging errors with context.

use std::fmt::Display;
use tracing::error;

/// Extension trait for logging errors with context.
///
/// Adds a `log` method to `Result` that records the error, the context
/// message and the caller's source location, then returns the result
/// unchanged so it can be propagated with `?`.
pub trait ResultExt<T, E> {
    /// Log the error with context if this is an `Err` variant.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use flow_engine::result_ext::ResultExt;
    ///
    /// let flow = store.get(id).await.log("loading flow for cancel")?;
    /// ```
    fn log<S: ToString>(self, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let caller_location = std::panic::Location::caller();
            error!(
                target: "flow_engine",
                error = %e,
                file = %format!("{}:{}", caller_location.file(), caller_location.line()),
                context = %context.to_string(),
                "Operation failed"
            );
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_ext_ok() {
        let result: Result<i32, &str> = Ok(42);
        assert_eq!(result.log("test context").unwrap(), 42);
    }

    #[test]
    fn test_result_ext_err() {
        let result: Result<i32, &str> = Err("test error");
        assert!(result.log("test context").is_err());
    }
}
