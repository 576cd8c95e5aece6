//! Interpreter and simulation tuning.

use std::time::Duration;

use serde::Deserialize;

use crate::engine::retry::ExponentialBackoff;

/// Engine configuration loaded from `FLOW_ENGINE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Per-step timeout when the step does not set its own.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    /// Random extra delay as a fraction of each backoff delay.
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,

    /// Fail instances older than this, if set.
    #[serde(default)]
    pub instance_deadline_seconds: Option<u64>,

    /// Upper bound on steps executed by one simulation.
    #[serde(default = "default_simulation_max_steps")]
    pub simulation_max_steps: usize,
}

fn default_step_timeout() -> u64 {
    30
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_initial_delay() -> u64 {
    2000
}

fn default_retry_max_delay() -> u64 {
    600_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_jitter() -> f64 {
    0.2
}

fn default_simulation_max_steps() -> usize {
    100
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("FLOW_ENGINE_").from_env::<EngineConfig>()
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    pub fn instance_deadline(&self) -> Option<chrono::Duration> {
        self.instance_deadline_seconds
            .map(|s| chrono::Duration::seconds(s.min(i64::MAX as u64) as i64))
    }

    /// Default retry policy for steps without an override.
    pub fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_initial_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
            self.retry_multiplier,
        )
        .with_jitter(self.retry_jitter)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_seconds: default_step_timeout(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            retry_multiplier: default_retry_multiplier(),
            retry_jitter: default_retry_jitter(),
            instance_deadline_seconds: None,
            simulation_max_steps: default_simulation_max_steps(),
        }
    }
}
