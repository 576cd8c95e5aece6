//! Worker configuration.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use flow_engine::dispatcher::{DispatcherConfig, PartitionAssignment};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier (UUID unless set).
    pub worker_id: String,

    /// This replica's index, `0..worker_count`.
    pub worker_index: u32,

    /// Number of replicas sharing the partitions.
    pub worker_count: u32,

    /// Maximum flows and cron jobs processed at once.
    pub max_concurrent: usize,

    /// Sleep between empty polls.
    pub poll_interval: Duration,

    /// Maximum rows claimed per poll.
    pub batch_size: usize,

    /// How long a claim hides a row from other workers.
    pub lease: Duration,

    /// Delay before a failed cron job is retried.
    pub cron_retry_delay: Duration,
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    lookup(name).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let worker_id = lookup("WORKER_ID")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.worker_id);

        let config = Self {
            worker_id,
            worker_index: parse_or(&lookup, "FLOW_WORKER_INDEX", defaults.worker_index),
            worker_count: parse_or(&lookup, "FLOW_WORKER_COUNT", defaults.worker_count),
            max_concurrent: parse_or(&lookup, "FLOW_MAX_CONCURRENT", defaults.max_concurrent),
            poll_interval: Duration::from_millis(parse_or(&lookup, "FLOW_POLL_INTERVAL_MS", 2000)),
            batch_size: parse_or(&lookup, "FLOW_BATCH_SIZE", defaults.batch_size),
            lease: Duration::from_secs(parse_or(&lookup, "FLOW_LEASE_SECONDS", 120)),
            cron_retry_delay: Duration::from_secs(parse_or(&lookup, "FLOW_CRON_RETRY_SECONDS", 60)),
        };

        if config.worker_count > 0 && config.worker_index >= config.worker_count {
            bail!(
                "FLOW_WORKER_INDEX ({}) must be below FLOW_WORKER_COUNT ({})",
                config.worker_index,
                config.worker_count
            );
        }

        Ok(config)
    }

    /// Reject settings that would let a claim expire under a running step.
    pub fn validate(&self, step_timeout: Duration) -> Result<()> {
        if self.lease <= step_timeout {
            bail!(
                "Lease ({}s) must exceed the step timeout ({}s)",
                self.lease.as_secs(),
                step_timeout.as_secs()
            );
        }
        if self.max_concurrent == 0 || self.batch_size == 0 {
            bail!("FLOW_MAX_CONCURRENT and FLOW_BATCH_SIZE must be positive");
        }
        Ok(())
    }

    /// Partitions polled by this replica.
    pub fn partitions(&self) -> PartitionAssignment {
        PartitionAssignment::for_replica(self.worker_index, self.worker_count)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            worker_id: self.worker_id.clone(),
            partitions: self.partitions(),
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
            lease: self.lease,
            max_concurrent: self.max_concurrent,
            cron_retry_delay: self.cron_retry_delay,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            worker_index: 0,
            worker_count: 1,
            max_concurrent: 8,
            poll_interval: Duration::from_millis(2000),
            batch_size: 50,
            lease: Duration::from_secs(120),
            cron_retry_delay: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.lease, Duration::from_secs(120));
        assert_eq!(config.partitions(), PartitionAssignment::All);
    }

    #[test]
    fn test_config_from_vars() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("WORKER_ID", "worker-a"),
            ("FLOW_WORKER_INDEX", "1"),
            ("FLOW_WORKER_COUNT", "3"),
            ("FLOW_POLL_INTERVAL_MS", "500"),
            ("FLOW_BATCH_SIZE", "not-a-number"),
        ]))
        .unwrap();

        assert_eq!(config.worker_id, "worker-a");
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.batch_size, 50);
        assert_eq!(
            config.partitions(),
            PartitionAssignment::Static { index: 1, count: 3 }
        );
        assert_eq!(config.dispatcher_config().worker_id, "worker-a");
    }

    #[test]
    fn test_index_out_of_range() {
        let result = WorkerConfig::from_lookup(lookup(&[
            ("FLOW_WORKER_INDEX", "2"),
            ("FLOW_WORKER_COUNT", "2"),
        ]));
        assert_err!(result);
    }

    #[test]
    fn test_lease_must_exceed_step_timeout() {
        let config = WorkerConfig {
            lease: Duration::from_secs(30),
            ..WorkerConfig::default()
        };
        assert_err!(config.validate(Duration::from_secs(30)));
        assert_ok!(config.validate(Duration::from_secs(10)));
    }
}
