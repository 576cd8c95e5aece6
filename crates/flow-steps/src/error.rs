//! Step execution error types.

use thiserror::Error;

/// Errors that can occur while executing a step.
///
/// The interpreter turns every variant except [`StepError::NotFound`] into a
/// failed attempt that feeds the retry policy.
#[derive(Debug, Error)]
pub enum StepError {
    /// Step kind not found in registry.
    #[error("Step kind not found: {0}")]
    NotFound(String),

    /// Step execution failed.
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Step execution timed out.
    #[error("Execution timed out after {0} seconds")]
    Timeout(u64),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Template rendering error.
    #[error("Template error: {0}")]
    Template(String),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for StepError {
    fn from(e: serde_json::Error) -> Self {
        StepError::Json(e.to_string())
    }
}

impl From<reqwest::Error> for StepError {
    fn from(e: reqwest::Error) -> Self {
        StepError::Http(e.to_string())
    }
}

impl From<minijinja::Error> for StepError {
    fn from(e: minijinja::Error) -> Self {
        StepError::Template(e.to_string())
    }
}
