//! In-memory store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    lease_expiry, CronJobStore, DefinitionStore, FlowStore, PersistResult, StoreError, StoreResult,
};
use crate::dispatcher::partition::PartitionAssignment;
use crate::model::{CronJob, Flow, FlowDefinition};

/// Store backed by process memory. Each map sits behind its own lock, which
/// makes every operation atomic per row.
#[derive(Debug, Default)]
pub struct MemoryStore {
    flows: Mutex<HashMap<Uuid, Flow>>,
    cron_jobs: Mutex<HashMap<String, CronJob>>,
    definitions: Mutex<HashMap<String, FlowDefinition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn insert(&self, flow: &Flow) -> StoreResult<()> {
        let mut flows = self.flows.lock().await;
        if flows.contains_key(&flow.id) {
            return Err(StoreError::Duplicate(flow.id.to_string()));
        }
        flows.insert(flow.id, flow.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<Flow>> {
        Ok(self.flows.lock().await.get(&id).cloned())
    }

    async fn list(&self, owner_id: Option<&str>, limit: usize) -> StoreResult<Vec<Flow>> {
        let flows = self.flows.lock().await;
        let mut matching: Vec<Flow> = flows
            .values()
            .filter(|f| owner_id.map(|o| f.owner_id == o).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created.cmp(&a.created).then(a.id.cmp(&b.id)));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn claim_due(
        &self,
        partitions: &PartitionAssignment,
        now: DateTime<Utc>,
        lease: Duration,
        batch_size: usize,
    ) -> StoreResult<Vec<Flow>> {
        let mut flows = self.flows.lock().await;

        let mut due: Vec<(DateTime<Utc>, Uuid)> = flows
            .values()
            .filter(|f| partitions.owns(f.schedule_partition))
            .filter_map(|f| f.due_time.filter(|t| *t <= now).map(|t| (t, f.id)))
            .collect();
        due.sort();
        due.truncate(batch_size);

        let expiry = lease_expiry(now, lease);
        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(flow) = flows.get_mut(&id) {
                flow.due_time = Some(expiry);
                flow.version += 1;
                claimed.push(flow.clone());
            }
        }
        Ok(claimed)
    }

    async fn persist(&self, flow: &Flow, expected_version: i64) -> StoreResult<PersistResult> {
        let mut flows = self.flows.lock().await;
        match flows.get_mut(&flow.id) {
            Some(stored) if stored.version == expected_version => {
                let version = expected_version + 1;
                *stored = Flow {
                    version,
                    ..flow.clone()
                };
                Ok(PersistResult::Success { version })
            }
            _ => Ok(PersistResult::Conflict),
        }
    }
}

#[async_trait]
impl CronJobStore for MemoryStore {
    async fn upsert(&self, job: &CronJob) -> StoreResult<()> {
        let mut jobs = self.cron_jobs.lock().await;
        let version = jobs.get(&job.id).map(|j| j.version + 1).unwrap_or(0);
        jobs.insert(
            job.id.clone(),
            CronJob {
                version,
                ..job.clone()
            },
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<CronJob>> {
        Ok(self.cron_jobs.lock().await.get(id).cloned())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        batch_size: usize,
    ) -> StoreResult<Vec<CronJob>> {
        let mut jobs = self.cron_jobs.lock().await;

        let mut due: Vec<(DateTime<Utc>, String)> = jobs
            .values()
            .filter(|j| j.due_time <= now)
            .map(|j| (j.due_time, j.id.clone()))
            .collect();
        due.sort();
        due.truncate(batch_size);

        let expiry = lease_expiry(now, lease);
        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = jobs.get_mut(&id) {
                job.due_time = expiry;
                job.version += 1;
                claimed.push(job.clone());
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
        let mut jobs = self.cron_jobs.lock().await;
        match jobs.get_mut(id) {
            Some(job) if job.version == expected_version => {
                job.due_time = due_time;
                job.version += 1;
                Ok(PersistResult::Success {
                    version: job.version,
                })
            }
            _ => Ok(PersistResult::Conflict),
        }
    }

    async fn delete(&self, id: &str, expected_version: i64) -> StoreResult<PersistResult> {
        let mut jobs = self.cron_jobs.lock().await;
        match jobs.get(id) {
            Some(job) if job.version == expected_version => {
                jobs.remove(id);
                Ok(PersistResult::Success {
                    version: expected_version + 1,
                })
            }
            _ => Ok(PersistResult::Conflict),
        }
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn insert(&self, definition: &FlowDefinition) -> StoreResult<()> {
        let mut definitions = self.definitions.lock().await;
        match definitions.get(&definition.id) {
            Some(existing) if existing == definition => Ok(()),
            Some(_) => Err(StoreError::Duplicate(definition.id.clone())),
            None => {
                definitions.insert(definition.id.clone(), definition.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> StoreResult<Option<FlowDefinition>> {
        Ok(self.definitions.lock().await.get(id).cloned())
    }
}
