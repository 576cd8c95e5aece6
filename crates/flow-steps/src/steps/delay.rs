//! Delay step.
//!
//! The first attempt suspends the flow and leaves the wake-up time in the
//! resume marker. Re-entry completes once that time has passed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::context::StepContext;
use crate::error::StepError;
use crate::outcome::StepOutcome;
use crate::registry::{StepConfig, StepExecutor};

/// Delay step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Delay in seconds.
    pub seconds: u64,
}

/// Delay step.
#[derive(Debug, Default)]
pub struct DelayStep;

impl DelayStep {
    /// Create a new delay step.
    pub fn new() -> Self {
        Self
    }

    fn resume_until(ctx: &StepContext) -> Option<DateTime<Utc>> {
        let until = ctx.resume.as_ref()?.get("until")?.as_str()?;
        DateTime::parse_from_rfc3339(until)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

#[async_trait]
impl StepExecutor for DelayStep {
    fn kind(&self) -> &'static str {
        "delay"
    }

    fn supports_dry_run(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        config: &StepConfig,
        ctx: &StepContext,
    ) -> Result<StepOutcome, StepError> {
        let delay: DelayConfig = config.parse()?;

        let until = match Self::resume_until(ctx) {
            Some(until) => until,
            None if delay.seconds == 0 => {
                return Ok(StepOutcome::completed().with_log("No delay configured"));
            }
            None => {
                let until = i64::try_from(delay.seconds)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .and_then(|d| ctx.now.checked_add_signed(d))
                    .ok_or_else(|| {
                        StepError::Configuration(format!("Delay of {}s is out of range", delay.seconds))
                    })?;
                return Ok(StepOutcome::suspended(
                    Duration::from_secs(delay.seconds),
                    Some(serde_json::json!({ "until": until.to_rfc3339() })),
                )
                .with_log(format!("Waiting {}s until {}", delay.seconds, until.to_rfc3339())));
            }
        };

        if ctx.now >= until {
            return Ok(StepOutcome::completed().with_log(format!("Delay elapsed at {}", until.to_rfc3339())));
        }

        // Woken early, e.g. after a lease expired. Sleep for the remainder.
        let remaining = (until - ctx.now).to_std().unwrap_or_default();
        Ok(StepOutcome::suspended(remaining, ctx.resume.clone())
            .with_log(format!("Still waiting until {}", until.to_rfc3339())))
    }
}
