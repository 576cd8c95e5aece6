//! The durable flow row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::definition::FlowDefinition;
use super::state::FlowExecutionState;
use crate::dispatcher::partition::schedule_partition;

/// One flow instance as stored.
///
/// `due_time` is set while the flow waits to be claimed and cleared once the
/// flow is terminal. `version` changes on every claim, persist and cancel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: Uuid,
    pub created: DateTime<Utc>,
    pub owner_id: String,
    pub definition_id: String,
    pub state: FlowExecutionState,
    pub schedule_partition: i32,
    pub due_time: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Flow {
    /// Create a new instance of `definition`, due at `due_time`.
    pub fn new(
        owner_id: impl Into<String>,
        definition: FlowDefinition,
        context: serde_json::Value,
        now: DateTime<Utc>,
        due_time: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            created: now,
            owner_id: owner_id.into(),
            definition_id: definition.id.clone(),
            state: FlowExecutionState::new(definition, context, now),
            schedule_partition: schedule_partition(&id),
            due_time: Some(due_time),
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
