//! Table definitions, applied idempotently at startup.

use crate::db::DbPool;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS flows (
        id UUID PRIMARY KEY,
        created TIMESTAMPTZ NOT NULL,
        owner_id TEXT NOT NULL,
        definition_id TEXT NOT NULL,
        state JSONB NOT NULL,
        schedule_partition INTEGER NOT NULL,
        due_time TIMESTAMPTZ NULL,
        version BIGINT NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_flows_due ON flows (due_time, schedule_partition)",
    "CREATE INDEX IF NOT EXISTS idx_flows_owner ON flows (owner_id, created DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS cron_jobs (
        id TEXT PRIMARY KEY,
        due_time TIMESTAMPTZ NOT NULL,
        data JSONB NOT NULL,
        version BIGINT NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_cron_jobs_due ON cron_jobs (due_time)",
    r#"
    CREATE TABLE IF NOT EXISTS flow_definitions (
        id TEXT PRIMARY KEY,
        definition JSONB NOT NULL,
        created TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

/// Create tables and indexes if they do not exist.
pub async fn ensure_schema(pool: &DbPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("Database schema ready");
    Ok(())
}
