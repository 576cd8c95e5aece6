//! Step attempt outcome types.

use std::time::Duration;

use crate::context::FlowContext;

/// Result of one step attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step finished; `output` is merged into the flow context.
    Completed { output: FlowContext, log: Vec<String> },

    /// Step failed; subject to the retry policy or `ignore_error` routing.
    Failed { error: String, log: Vec<String> },

    /// Step yields and wants to be re-entered after `resume_after`.
    ///
    /// `marker` is handed back to the step on re-entry.
    Suspended {
        resume_after: Duration,
        marker: Option<serde_json::Value>,
        log: Vec<String>,
    },
}

impl StepOutcome {
    /// Create a completed outcome without output.
    pub fn completed() -> Self {
        Self::Completed {
            output: FlowContext::new(),
            log: Vec::new(),
        }
    }

    /// Create a completed outcome with context output.
    pub fn completed_with(output: FlowContext) -> Self {
        Self::Completed {
            output,
            log: Vec::new(),
        }
    }

    /// Create a failed outcome.
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            log: Vec::new(),
        }
    }

    /// Create a suspended outcome.
    pub fn suspended(resume_after: Duration, marker: Option<serde_json::Value>) -> Self {
        Self::Suspended {
            resume_after,
            marker,
            log: Vec::new(),
        }
    }

    /// Append a log line.
    pub fn with_log(mut self, line: impl Into<String>) -> Self {
        self.log_mut().push(line.into());
        self
    }

    /// Prepend log lines collected before the outcome was known.
    pub fn with_log_prefix(mut self, lines: Vec<String>) -> Self {
        let log = self.log_mut();
        let mut merged = lines;
        merged.append(log);
        *log = merged;
        self
    }

    /// Log lines written during the attempt.
    pub fn log(&self) -> &[String] {
        match self {
            Self::Completed { log, .. } | Self::Failed { log, .. } | Self::Suspended { log, .. } => {
                log
            }
        }
    }

    fn log_mut(&mut self) -> &mut Vec<String> {
        match self {
            Self::Completed { log, .. } | Self::Failed { log, .. } | Self::Suspended { log, .. } => {
                log
            }
        }
    }

    /// Returns true if the attempt completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Returns true if the attempt failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Returns true if the step suspended itself.
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_completed() {
        let outcome = StepOutcome::completed().with_log("done");
        assert!(outcome.is_completed());
        assert_eq!(outcome.log(), ["done".to_string()]);
    }

    #[test]
    fn test_outcome_failed() {
        let outcome = StepOutcome::failed("boom");
        assert!(outcome.is_failed());
        assert!(matches!(outcome, StepOutcome::Failed { ref error, .. } if error == "boom"));
    }

    #[test]
    fn test_outcome_log_prefix() {
        let outcome = StepOutcome::suspended(Duration::from_secs(5), None)
            .with_log("waiting")
            .with_log_prefix(vec!["rendered".to_string()]);

        assert!(outcome.is_suspended());
        assert_eq!(outcome.log(), ["rendered".to_string(), "waiting".to_string()]);
    }
}
