//! Scheduler / dispatcher.
//!
//! Each tick claims due flows in the owned partitions plus due cron jobs,
//! runs them concurrently up to the configured limit and persists the
//! results with an optimistic version check. Replicas coordinate only
//! through the store.

pub mod cron;
pub mod partition;

pub use cron::{CronHandler, CronHandlers};
pub use partition::{schedule_partition, PartitionAssignment, SCHEDULE_PARTITIONS};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::engine::{Clock, Interpreter};
use crate::model::{CronJob, Flow};
use crate::store::{CronJobStore, FlowStore, PersistResult};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Identifies this worker in logs.
    pub worker_id: String,
    pub partitions: PartitionAssignment,
    pub poll_interval: Duration,
    /// Upper bound on rows claimed per tick.
    pub batch_size: usize,
    /// How long a claim keeps a row away from other workers.
    pub lease: Duration,
    pub max_concurrent: usize,
    /// Delay before retrying a cron job whose handler failed or is missing.
    pub cron_retry_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_id: "local".to_string(),
            partitions: PartitionAssignment::All,
            poll_interval: Duration::from_secs(2),
            batch_size: 50,
            lease: Duration::from_secs(120),
            max_concurrent: 8,
            cron_retry_delay: Duration::from_secs(60),
        }
    }
}

/// What happened to one claimed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Processed {
    Advanced,
    Conflict,
    Error,
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub flows_claimed: usize,
    pub flows_advanced: usize,
    pub cron_jobs_claimed: usize,
    pub conflicts: usize,
    pub errors: usize,
}

impl TickReport {
    pub fn claimed(&self) -> usize {
        self.flows_claimed + self.cron_jobs_claimed
    }

    fn record(&mut self, processed: Processed, is_flow: bool) {
        match processed {
            Processed::Advanced if is_flow => self.flows_advanced += 1,
            Processed::Advanced => {}
            Processed::Conflict => self.conflicts += 1,
            Processed::Error => self.errors += 1,
        }
    }
}

struct Inner {
    store: Arc<dyn FlowStore>,
    cron_store: Arc<dyn CronJobStore>,
    interpreter: Interpreter,
    cron_handlers: CronHandlers,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    semaphore: Arc<Semaphore>,
}

/// Claims due work and drives it through the interpreter.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

/// Running dispatcher loop.
///
/// Dropping the handle also stops the loop, without waiting for it.
pub struct DispatcherHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Signal the loop and wait for in-flight work to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Dispatcher loop panicked");
        }
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn FlowStore>,
        cron_store: Arc<dyn CronJobStore>,
        interpreter: Interpreter,
        cron_handlers: CronHandlers,
        config: DispatcherConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                store,
                cron_store,
                interpreter,
                cron_handlers,
                config,
                clock,
                semaphore,
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Spawn the polling loop.
    pub fn start(&self) -> DispatcherHandle {
        let (stop, mut stopped) = watch::channel(false);
        let this = self.clone();

        let task = tokio::spawn(async move {
            let config = &this.inner.config;
            tracing::info!(
                worker_id = %config.worker_id,
                partitions = %config.partitions,
                max_concurrent = config.max_concurrent,
                "Dispatcher started"
            );

            loop {
                if *stopped.borrow() {
                    break;
                }

                let report = this.tick().await;
                if report.claimed() > 0 {
                    tracing::debug!(worker_id = %config.worker_id, ?report, "Tick finished");
                    // Backlog: poll again right away.
                    continue;
                }

                tokio::select! {
                    _ = tokio::time::sleep(config.poll_interval) => {}
                    changed = stopped.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            tracing::info!(worker_id = %config.worker_id, "Dispatcher stopped");
        });

        DispatcherHandle { stop, task }
    }

    /// Run one claim-execute-persist round and wait for it to finish.
    ///
    /// Never claims more rows than there are free execution slots.
    pub async fn tick(&self) -> TickReport {
        let inner = &self.inner;
        let config = &inner.config;
        let mut report = TickReport::default();
        let now = inner.clock.now();

        let capacity = config.batch_size.min(inner.semaphore.available_permits());
        if capacity == 0 {
            return report;
        }

        let flows = match inner
            .store
            .claim_due(&config.partitions, now, config.lease, capacity)
            .await
        {
            Ok(flows) => flows,
            Err(e) => {
                tracing::error!(worker_id = %config.worker_id, error = %e, "Failed to claim flows");
                report.errors += 1;
                Vec::new()
            }
        };

        let cron_capacity = capacity - flows.len();
        let jobs = if cron_capacity == 0 {
            Vec::new()
        } else {
            match inner.cron_store.claim_due(now, config.lease, cron_capacity).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::error!(worker_id = %config.worker_id, error = %e, "Failed to claim cron jobs");
                    report.errors += 1;
                    Vec::new()
                }
            }
        };

        report.flows_claimed = flows.len();
        report.cron_jobs_claimed = jobs.len();

        let mut running = JoinSet::new();
        for flow in flows {
            let Ok(permit) = inner.semaphore.clone().acquire_owned().await else {
                break;
            };
            let this = self.clone();
            running.spawn(async move {
                let _permit = permit;
                (this.process_flow(flow).await, true)
            });
        }
        for job in jobs {
            let Ok(permit) = inner.semaphore.clone().acquire_owned().await else {
                break;
            };
            let this = self.clone();
            running.spawn(async move {
                let _permit = permit;
                (this.process_cron_job(job).await, false)
            });
        }

        while let Some(result) = running.join_next().await {
            match result {
                Ok((processed, is_flow)) => report.record(processed, is_flow),
                Err(e) => {
                    tracing::error!(worker_id = %config.worker_id, error = %e, "Claimed work panicked");
                    report.errors += 1;
                }
            }
        }

        report
    }

    async fn process_flow(&self, flow: Flow) -> Processed {
        let inner = &self.inner;
        let expected_version = flow.version;
        tracing::debug!(
            worker_id = %inner.config.worker_id,
            flow_id = %flow.id,
            partition = flow.schedule_partition,
            version = expected_version,
            "Flow claimed"
        );

        let next = inner.interpreter.advance_flow(&flow).await;

        match inner.store.persist(&next, expected_version).await {
            Ok(PersistResult::Success { version }) => {
                tracing::debug!(
                    flow_id = %next.id,
                    status = %next.state.status,
                    next_step = ?next.state.next_step_id,
                    due_time = ?next.due_time,
                    version,
                    "Flow persisted"
                );
                Processed::Advanced
            }
            Ok(PersistResult::Conflict) => {
                tracing::info!(
                    flow_id = %next.id,
                    "Flow changed while running (cancelled or reclaimed), transition discarded"
                );
                Processed::Conflict
            }
            Err(e) => {
                tracing::error!(flow_id = %next.id, error = %e, "Failed to persist flow");
                Processed::Error
            }
        }
    }

    async fn process_cron_job(&self, job: CronJob) -> Processed {
        let inner = &self.inner;
        let now = inner.clock.now();
        let retry_at = now
            + chrono::Duration::from_std(inner.config.cron_retry_delay)
                .unwrap_or_else(|_| chrono::Duration::minutes(1));

        let next = match inner.cron_handlers.get(&job.data.kind) {
            Some(handler) => match handler.run(&job, now).await {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, kind = %job.data.kind, error = %e, "Cron job failed");
                    Some(retry_at)
                }
            },
            None => {
                tracing::warn!(job_id = %job.id, kind = %job.data.kind, "No handler for cron job kind");
                Some(retry_at)
            }
        };

        let result = match next {
            Some(due_time) => inner.cron_store.reschedule(&job.id, due_time, job.version).await,
            None => inner.cron_store.delete(&job.id, job.version).await,
        };

        match result {
            Ok(PersistResult::Success { .. }) => {
                tracing::debug!(job_id = %job.id, next = ?next, "Cron job processed");
                Processed::Advanced
            }
            Ok(PersistResult::Conflict) => {
                tracing::debug!(job_id = %job.id, "Cron job changed while running");
                Processed::Conflict
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to update cron job");
                Processed::Error
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("cron_handlers", &self.inner.cron_handlers)
            .finish_non_exhaustive()
    }
}
