//! PostgreSQL store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::{
    lease_expiry, CronJobStore, DefinitionStore, FlowStore, PersistResult, StoreError, StoreResult,
};
use crate::db::DbPool;
use crate::dispatcher::partition::PartitionAssignment;
use crate::model::{CronJob, CronJobData, Flow, FlowDefinition, FlowExecutionState};

const FLOW_COLUMNS: &str =
    "id, created, owner_id, definition_id, state, schedule_partition, due_time, version";

#[derive(Debug, FromRow)]
struct FlowRow {
    id: Uuid,
    created: DateTime<Utc>,
    owner_id: String,
    definition_id: String,
    state: Json<FlowExecutionState>,
    schedule_partition: i32,
    due_time: Option<DateTime<Utc>>,
    version: i64,
}

impl From<FlowRow> for Flow {
    fn from(row: FlowRow) -> Self {
        Self {
            id: row.id,
            created: row.created,
            owner_id: row.owner_id,
            definition_id: row.definition_id,
            state: row.state.0,
            schedule_partition: row.schedule_partition,
            due_time: row.due_time,
            version: row.version,
        }
    }
}

#[derive(Debug, FromRow)]
struct CronJobRow {
    id: String,
    due_time: DateTime<Utc>,
    data: Json<CronJobData>,
    version: i64,
}

impl From<CronJobRow> for CronJob {
    fn from(row: CronJobRow) -> Self {
        Self {
            id: row.id,
            due_time: row.due_time,
            data: row.data.0,
            version: row.version,
        }
    }
}

/// Store over the `flows`, `cron_jobs` and `flow_definitions` tables.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// A claim batch interrupted by a database error keeps the rows it already
/// holds. Only an error before the first claim is returned.
fn interrupted_claim<T>(claimed: Vec<T>, error: sqlx::Error, table: &str) -> StoreResult<Vec<T>> {
    if claimed.is_empty() {
        return Err(error.into());
    }
    tracing::warn!(
        table,
        claimed = claimed.len(),
        error = %error,
        "Claim batch interrupted, keeping rows already claimed"
    );
    Ok(claimed)
}

fn persisted(version: Option<i64>) -> PersistResult {
    match version {
        Some(version) => PersistResult::Success { version },
        None => PersistResult::Conflict,
    }
}

#[async_trait]
impl FlowStore for PgStore {
    async fn insert(&self, flow: &Flow) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO flows (id, created, owner_id, definition_id, state, schedule_partition, due_time, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(flow.id)
        .bind(flow.created)
        .bind(&flow.owner_id)
        .bind(&flow.definition_id)
        .bind(Json(&flow.state))
        .bind(flow.schedule_partition)
        .bind(flow.due_time)
        .bind(flow.version)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Duplicate(flow.id.to_string())
            } else {
                StoreError::Database(e)
            }
        })?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Flow>> {
        let row = sqlx::query_as::<_, FlowRow>(&format!(
            "SELECT {} FROM flows WHERE id = $1",
            FLOW_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Flow::from))
    }

    async fn list(&self, owner_id: Option<&str>, max: usize) -> StoreResult<Vec<Flow>> {
        let rows = sqlx::query_as::<_, FlowRow>(&format!(
            r#"
            SELECT {}
            FROM flows
            WHERE ($1::TEXT IS NULL OR owner_id = $1)
            ORDER BY created DESC, id
            LIMIT $2
            "#,
            FLOW_COLUMNS
        ))
        .bind(owner_id)
        .bind(limit(max))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Flow::from).collect())
    }

    async fn claim_due(
        &self,
        partitions: &PartitionAssignment,
        now: DateTime<Utc>,
        lease: Duration,
        batch_size: usize,
    ) -> StoreResult<Vec<Flow>> {
        let candidates: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT id, version
            FROM flows
            WHERE due_time <= $1
              AND ($2::INTEGER[] IS NULL OR schedule_partition = ANY($2))
            ORDER BY due_time ASC
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(partitions.partitions())
        .bind(limit(batch_size))
        .fetch_all(&self.pool)
        .await?;

        let expiry = lease_expiry(now, lease);
        let claim_sql = format!(
            r#"
            UPDATE flows
            SET due_time = $1, version = version + 1
            WHERE id = $2 AND version = $3 AND due_time <= $4
            RETURNING {}
            "#,
            FLOW_COLUMNS
        );

        let mut claimed = Vec::with_capacity(candidates.len());
        for (id, version) in candidates {
            let row = sqlx::query_as::<_, FlowRow>(&claim_sql)
                .bind(expiry)
                .bind(id)
                .bind(version)
                .bind(now)
                .fetch_optional(&self.pool)
                .await;

            match row {
                Ok(Some(row)) => claimed.push(Flow::from(row)),
                Ok(None) => tracing::debug!(flow_id = %id, "Flow claimed by another worker"),
                Err(e) => return interrupted_claim(claimed, e, "flows"),
            }
        }

        Ok(claimed)
    }

    async fn persist(&self, flow: &Flow, expected_version: i64) -> StoreResult<PersistResult> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE flows
            SET state = $1, due_time = $2, version = version + 1
            WHERE id = $3 AND version = $4
            RETURNING version
            "#,
        )
        .bind(Json(&flow.state))
        .bind(flow.due_time)
        .bind(flow.id)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(persisted(version))
    }
}

#[async_trait]
impl CronJobStore for PgStore {
    async fn upsert(&self, job: &CronJob) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cron_jobs (id, due_time, data, version)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (id) DO UPDATE
            SET due_time = EXCLUDED.due_time, data = EXCLUDED.data, version = cron_jobs.version + 1
            "#,
        )
        .bind(&job.id)
        .bind(job.due_time)
        .bind(Json(&job.data))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<CronJob>> {
        let row = sqlx::query_as::<_, CronJobRow>(
            "SELECT id, due_time, data, version FROM cron_jobs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CronJob::from))
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        batch_size: usize,
    ) -> StoreResult<Vec<CronJob>> {
        let candidates: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT id, version
            FROM cron_jobs
            WHERE due_time <= $1
            ORDER BY due_time ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit(batch_size))
        .fetch_all(&self.pool)
        .await?;

        let expiry = lease_expiry(now, lease);
        let mut claimed = Vec::with_capacity(candidates.len());
        for (id, version) in candidates {
            let row = sqlx::query_as::<_, CronJobRow>(
                r#"
                UPDATE cron_jobs
                SET due_time = $1, version = version + 1
                WHERE id = $2 AND version = $3 AND due_time <= $4
                RETURNING id, due_time, data, version
                "#,
            )
            .bind(expiry)
            .bind(&id)
            .bind(version)
            .bind(now)
            .fetch_optional(&self.pool)
            .await;

            match row {
                Ok(Some(row)) => claimed.push(CronJob::from(row)),
                Ok(None) => tracing::debug!(job_id = %id, "Cron job claimed by another worker"),
                Err(e) => return interrupted_claim(claimed, e, "cron_jobs"),
            }
        }

        Ok(claimed)
    }

    async fn reschedule(
        &self,
        id: &str,
        due_time: DateTime<Utc>,
        expected_version: i64,
    ) -> StoreResult<PersistResult> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE cron_jobs
            SET due_time = $1, version = version + 1
            WHERE id = $2 AND version = $3
            RETURNING version
            "#,
        )
        .bind(due_time)
        .bind(id)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(persisted(version))
    }

    async fn delete(&self, id: &str, expected_version: i64) -> StoreResult<PersistResult> {
        let result = sqlx::query("DELETE FROM cron_jobs WHERE id = $1 AND version = $2")
            .bind(id)
            .bind(expected_version)
            .execute(&self.pool)
            .await?;

        Ok(if result.rows_affected() == 1 {
            PersistResult::Success {
                version: expected_version + 1,
            }
        } else {
            PersistResult::Conflict
        })
    }
}

#[async_trait]
impl DefinitionStore for PgStore {
    async fn insert(&self, definition: &FlowDefinition) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO flow_definitions (id, definition)
            VALUES ($1, $2)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&definition.id)
        .bind(Json(definition))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match DefinitionStore::get(self, &definition.id).await? {
            Some(existing) if existing == *definition => Ok(()),
            _ => Err(StoreError::Duplicate(definition.id.clone())),
        }
    }

    async fn get(&self, id: &str) -> StoreResult<Option<FlowDefinition>> {
        let row: Option<Json<FlowDefinition>> =
            sqlx::query_scalar("SELECT definition FROM flow_definitions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|d| d.0))
    }
}
