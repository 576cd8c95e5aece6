//! Flow service.
//!
//! Trigger API (definitions and new instances), the read projection used by
//! history views, and cancellation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::Clock;
use crate::error::{AppError, AppResult};
use crate::model::{Flow, FlowDefinition, FlowExecutionState, FlowStatus};
use crate::result_ext::ResultExt;
use crate::store::{DefinitionStore, FlowStore, PersistResult};

/// How often cancel re-reads a flow that changed under it.
const CANCEL_ATTEMPTS: usize = 5;

/// Upper bound on `list` results.
const MAX_LIST_LIMIT: usize = 500;

/// Read projection of one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecutionStateDto {
    pub id: Uuid,
    pub owner_id: String,
    pub definition_id: String,
    pub created: DateTime<Utc>,
    pub due_time: Option<DateTime<Utc>>,
    pub schedule_partition: i32,
    pub version: i64,
    pub state: FlowExecutionState,
}

impl From<Flow> for FlowExecutionStateDto {
    fn from(flow: Flow) -> Self {
        Self {
            id: flow.id,
            owner_id: flow.owner_id,
            definition_id: flow.definition_id,
            created: flow.created,
            due_time: flow.due_time,
            schedule_partition: flow.schedule_partition,
            version: flow.version,
            state: flow.state,
        }
    }
}

/// Flow summary for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSummary {
    pub id: Uuid,
    pub owner_id: String,
    pub definition_id: String,
    pub description: String,
    pub status: FlowStatus,
    pub created: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
    pub due_time: Option<DateTime<Utc>>,
    pub next_step_id: Option<String>,
    pub attempts: usize,
    pub error: Option<String>,
}

impl From<Flow> for FlowSummary {
    fn from(flow: Flow) -> Self {
        let attempts = flow.state.attempt_count();
        Self {
            id: flow.id,
            owner_id: flow.owner_id,
            definition_id: flow.definition_id,
            description: flow.state.description,
            status: flow.state.status,
            created: flow.created,
            completed: flow.state.completed,
            due_time: flow.due_time,
            next_step_id: flow.state.next_step_id,
            attempts,
            error: flow.state.error,
        }
    }
}

/// Flow management service.
#[derive(Clone)]
pub struct FlowService {
    flows: Arc<dyn FlowStore>,
    definitions: Arc<dyn DefinitionStore>,
    clock: Arc<dyn Clock>,
}

impl FlowService {
    /// Create a new flow service.
    pub fn new(
        flows: Arc<dyn FlowStore>,
        definitions: Arc<dyn DefinitionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            flows,
            definitions,
            clock,
        }
    }

    /// Validate and store a definition.
    pub async fn register_definition(&self, definition: &FlowDefinition) -> AppResult<()> {
        definition.validate()?;
        self.definitions
            .insert(definition)
            .await
            .log("registering flow definition")?;

        tracing::info!(
            definition_id = %definition.id,
            steps = definition.steps.len(),
            "Flow definition registered"
        );
        Ok(())
    }

    pub async fn get_definition(&self, id: &str) -> AppResult<FlowDefinition> {
        self.definitions
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Flow definition '{}' not found", id)))
    }

    /// Create a new instance of a stored definition, due at `due_time` or now.
    pub async fn create_instance(
        &self,
        definition_id: &str,
        owner_id: &str,
        context: serde_json::Value,
        due_time: Option<DateTime<Utc>>,
    ) -> AppResult<Uuid> {
        let definition = self.get_definition(definition_id).await?;
        let now = self.clock.now();
        let flow = Flow::new(owner_id, definition, context, now, due_time.unwrap_or(now));

        self.flows.insert(&flow).await.log("inserting flow")?;

        tracing::info!(
            flow_id = %flow.id,
            definition_id = %definition_id,
            owner_id = %owner_id,
            partition = flow.schedule_partition,
            due_time = ?flow.due_time,
            "Flow created"
        );
        Ok(flow.id)
    }

    pub async fn get(&self, flow_id: Uuid) -> AppResult<FlowExecutionStateDto> {
        self.load(flow_id).await.map(FlowExecutionStateDto::from)
    }

    /// Most recent flows first.
    pub async fn list(&self, owner_id: Option<&str>, limit: usize) -> AppResult<Vec<FlowSummary>> {
        let flows = self
            .flows
            .list(owner_id, limit.clamp(1, MAX_LIST_LIMIT))
            .await?;
        Ok(flows.into_iter().map(FlowSummary::from).collect())
    }

    /// Cancel a flow. Returns the flow's status afterwards.
    ///
    /// Terminal flows are left alone. A worker holding a claim on the flow
    /// loses its persist and discards its transition.
    pub async fn cancel(&self, flow_id: Uuid) -> AppResult<FlowStatus> {
        for _ in 0..CANCEL_ATTEMPTS {
            let mut flow = self.load(flow_id).await?;
            if flow.is_terminal() {
                tracing::debug!(%flow_id, status = %flow.state.status, "Flow already terminal, cancel ignored");
                return Ok(flow.state.status);
            }

            let expected_version = flow.version;
            flow.state.finish(FlowStatus::Cancelled, self.clock.now());
            flow.due_time = None;

            match self.flows.persist(&flow, expected_version).await? {
                PersistResult::Success { .. } => {
                    tracing::info!(%flow_id, "Flow cancelled");
                    return Ok(FlowStatus::Cancelled);
                }
                PersistResult::Conflict => {
                    tracing::debug!(%flow_id, "Flow changed during cancel, retrying");
                }
            }
        }

        Err(AppError::Conflict(format!(
            "Flow {} kept changing, cancel not applied",
            flow_id
        )))
    }

    async fn load(&self, flow_id: Uuid) -> AppResult<Flow> {
        FlowStore::get(self.flows.as_ref(), flow_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Flow {} not found", flow_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::PartitionAssignment;
    use crate::engine::ManualClock;
    use crate::model::FlowStepDefinition;
    use crate::store::MemoryStore;
    use flow_steps::StepConfig;
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn definition() -> FlowDefinition {
        FlowDefinition::new("notify", "1").with_step(
            "1",
            FlowStepDefinition::new(StepConfig::new("set", json!({"values": {"done": true}}))),
        )
    }

    fn service() -> (FlowService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let service = FlowService::new(
            store.clone(),
            store.clone(),
            Arc::new(ManualClock::new(now())),
        );
        (service, store)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (service, _) = service();
        assert_ok!(service.register_definition(&definition()).await);
        // identical re-registration is a no-op
        assert_ok!(service.register_definition(&definition()).await);

        let id = service
            .create_instance("notify", "rule-1", json!({"event": {"id": 7}}), None)
            .await
            .unwrap();

        let dto = service.get(id).await.unwrap();
        assert_eq!(dto.owner_id, "rule-1");
        assert_eq!(dto.definition_id, "notify");
        assert_eq!(dto.due_time, Some(now()));
        assert_eq!(dto.state.status, FlowStatus::Running);
        assert_eq!(dto.state.context["event"]["id"], 7);

        let summaries = service.list(Some("rule-1"), 10).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, id);
    }

    #[tokio::test]
    async fn test_unknown_definition_and_flow() {
        let (service, _) = service();
        let err = service
            .create_instance("missing", "rule-1", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = service.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_definition() {
        let (service, _) = service();
        let err = service
            .register_definition(&FlowDefinition::new("empty", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cancel_clears_due_time_and_is_idempotent() {
        let (service, _) = service();
        service.register_definition(&definition()).await.unwrap();
        let id = service
            .create_instance("notify", "rule-1", json!({}), None)
            .await
            .unwrap();

        assert_eq!(service.cancel(id).await.unwrap(), FlowStatus::Cancelled);
        let dto = service.get(id).await.unwrap();
        assert_eq!(dto.due_time, None);
        assert_eq!(dto.state.status, FlowStatus::Cancelled);
        assert!(dto.state.completed.is_some());

        assert_eq!(service.cancel(id).await.unwrap(), FlowStatus::Cancelled);
        assert_eq!(service.get(id).await.unwrap().version, dto.version);
    }

    #[tokio::test]
    async fn test_cancel_wins_over_claimed_flow() {
        let (service, store) = service();
        service.register_definition(&definition()).await.unwrap();
        let id = service
            .create_instance("notify", "rule-1", json!({}), None)
            .await
            .unwrap();

        let claimed = FlowStore::claim_due(
            store.as_ref(),
            &PartitionAssignment::All,
            now(),
            Duration::from_secs(60),
            10,
        )
        .await
        .unwrap();
        assert_eq!(claimed.len(), 1);

        service.cancel(id).await.unwrap();

        let result = store.persist(&claimed[0], claimed[0].version).await.unwrap();
        assert_eq!(result, PersistResult::Conflict);
        assert_eq!(service.get(id).await.unwrap().state.status, FlowStatus::Cancelled);
    }
}
