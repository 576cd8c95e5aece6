//! Cron job handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::CronJob;

/// Runs cron jobs of one kind.
#[async_trait]
pub trait CronHandler: Send + Sync {
    /// Job kind this handler serves (`CronJobData::kind`).
    fn kind(&self) -> &'static str;

    /// Run the job. Returns the next due time, or `None` when the job is
    /// done and should be deleted.
    async fn run(&self, job: &CronJob, now: DateTime<Utc>) -> anyhow::Result<Option<DateTime<Utc>>>;
}

/// Handlers keyed by job kind.
#[derive(Clone, Default)]
pub struct CronHandlers {
    handlers: HashMap<String, Arc<dyn CronHandler>>,
}

impl CronHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: CronHandler + 'static>(&mut self, handler: H) {
        self.handlers
            .insert(handler.kind().to_string(), Arc::new(handler));
    }

    pub fn with<H: CronHandler + 'static>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn CronHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for CronHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronHandlers")
            .field("kinds", &self.kinds())
            .finish()
    }
}
