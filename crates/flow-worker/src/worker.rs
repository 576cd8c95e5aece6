//! Worker lifecycle management.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use flow_engine::config::{DatabaseConfig, EngineConfig};
use flow_engine::db::{create_pool, ensure_schema};
use flow_engine::dispatcher::{CronHandlers, Dispatcher};
use flow_engine::engine::{Clock, Interpreter, SystemClock};
use flow_engine::store::{CronJobStore, FlowStore, PgStore};
use flow_steps::steps::create_default_registry;
use flow_steps::StepRegistry;

use crate::config::WorkerConfig;

/// One worker replica: a dispatcher over the shared store.
pub struct Worker {
    config: WorkerConfig,
    dispatcher: Dispatcher,
}

impl Worker {
    /// Connect to PostgreSQL and build a worker with the built-in steps.
    pub async fn new(
        config: WorkerConfig,
        engine_config: &EngineConfig,
        db_config: &DatabaseConfig,
    ) -> Result<Self> {
        let pool = create_pool(db_config).await?;
        ensure_schema(&pool).await?;
        let store = Arc::new(PgStore::new(pool));

        Self::with_store(
            config,
            engine_config,
            store,
            create_default_registry(),
            CronHandlers::new(),
            Arc::new(SystemClock),
        )
    }

    /// Build a worker over any store.
    pub fn with_store<S>(
        config: WorkerConfig,
        engine_config: &EngineConfig,
        store: Arc<S>,
        registry: StepRegistry,
        cron_handlers: CronHandlers,
        clock: Arc<dyn Clock>,
    ) -> Result<Self>
    where
        S: FlowStore + CronJobStore + 'static,
    {
        config.validate(engine_config.step_timeout())?;

        let interpreter = Interpreter::from_config(registry, engine_config, clock.clone());
        tracing::debug!(
            steps = ?interpreter.registry().list(),
            cron_kinds = ?cron_handlers.kinds(),
            "Executors registered"
        );

        let dispatcher = Dispatcher::new(
            store.clone(),
            store,
            interpreter,
            cron_handlers,
            config.dispatcher_config(),
            clock,
        );

        Ok(Self { config, dispatcher })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run until `shutdown` resolves, then finish in-flight work.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        tracing::info!(
            worker_id = %self.config.worker_id,
            hostname = %hostname,
            partitions = %self.config.partitions(),
            max_concurrent = self.config.max_concurrent,
            lease_seconds = self.config.lease.as_secs(),
            "Worker started"
        );

        let handle = self.dispatcher.start();
        shutdown.await;

        tracing::info!(worker_id = %self.config.worker_id, "Stopping worker, waiting for in-flight flows");
        handle.stop().await;

        Ok(())
    }
}
