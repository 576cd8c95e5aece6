//! Store contract consumed by the dispatcher and the flow service.
//!
//! All mutation goes through single-row conditional updates keyed on
//! `version`. Two implementations ship: [`MemoryStore`] for tests and
//! simulation-like embedding, and [`PgStore`] for production.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::dispatcher::partition::PartitionAssignment;
use crate::model::{CronJob, Flow, FlowDefinition};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Duplicate key: {0}")]
    Duplicate(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistResult {
    /// Written; the row now has `version`.
    Success { version: i64 },
    /// The row changed (or vanished) since it was read.
    Conflict,
}

impl PersistResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Durable flow rows.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Insert a new flow. Fails on duplicate id.
    async fn insert(&self, flow: &Flow) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<Flow>>;

    /// Most recent flows first, optionally for one owner.
    async fn list(&self, owner_id: Option<&str>, limit: usize) -> StoreResult<Vec<Flow>>;

    /// Claim up to `batch_size` flows due at `now` in the assigned partitions.
    ///
    /// Each claim is a per-row conditional update that pushes `due_time` to
    /// `now + lease` and bumps `version`; rows claimed concurrently by
    /// someone else are skipped. Returned flows carry the post-claim version.
    async fn claim_due(
        &self,
        partitions: &PartitionAssignment,
        now: DateTime<Utc>,
        lease: Duration,
        batch_size: usize,
    ) -> StoreResult<Vec<Flow>>;

    /// Write `flow` if the stored version still equals `expected_version`.
    async fn persist(&self, flow: &Flow, expected_version: i64) -> StoreResult<PersistResult>;
}

/// Generic cron job rows.
#[async_trait]
pub trait CronJobStore: Send + Sync {
    /// Insert or replace a job definition.
    async fn upsert(&self, job: &CronJob) -> StoreResult<()>;

    async fn get(&self, id: &str) -> StoreResult<Option<CronJob>>;

    /// Claim due jobs, same discipline as [`FlowStore::claim_due`].
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        batch_size: usize,
    ) -> StoreResult<Vec<CronJob>>;

    /// Move a claimed job to its next due time.
    async fn reschedule(
        &self,
        id: &str,
        due_time: DateTime<Utc>,
        expected_version: i64,
    ) -> StoreResult<PersistResult>;

    /// Remove a finished job.
    async fn delete(&self, id: &str, expected_version: i64) -> StoreResult<PersistResult>;
}

/// Insert-only definition storage.
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Store a definition. Re-inserting the same document is a no-op; a
    /// different document under an existing id is [`StoreError::Duplicate`].
    async fn insert(&self, definition: &FlowDefinition) -> StoreResult<()>;

    async fn get(&self, id: &str) -> StoreResult<Option<FlowDefinition>>;
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::hours(1))
}
