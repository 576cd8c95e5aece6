//! Execution state of one flow instance.
//!
//! The state is a value: the interpreter takes the current state and returns
//! the next one, and the dispatcher persists it wholesale.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use flow_steps::FlowContext;
use serde::{Deserialize, Serialize};

use super::definition::FlowDefinition;

/// Flow status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Ready to run the next step.
    Running,
    /// Waiting for the row's due time (suspension or retry backoff).
    Scheduled,
    /// Reached the end of the graph.
    Completed,
    /// A step exhausted its retries or the graph is broken.
    Failed,
    /// Cancelled from outside.
    Cancelled,
}

impl FlowStatus {
    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Scheduled => "scheduled",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed {
        error: String,
    },
    Suspended {
        until: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        marker: Option<serde_json::Value>,
    },
}

/// One attempt of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowExecutionStepAttempt {
    pub started: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,

    #[serde(default)]
    pub log: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AttemptOutcome>,
}

impl FlowExecutionStepAttempt {
    /// Start a new attempt.
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started: at,
            completed: None,
            log: Vec::new(),
            outcome: None,
        }
    }

    /// Close the attempt.
    pub fn finish(&mut self, at: DateTime<Utc>, outcome: AttemptOutcome, log: Vec<String>) {
        self.completed = Some(at);
        self.outcome = Some(outcome);
        self.log.extend(log);
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Some(AttemptOutcome::Failed { .. }))
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            Some(AttemptOutcome::Failed { error }) => Some(error),
            _ => None,
        }
    }
}

/// Progress of one step. Attempts are append-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowExecutionStepState {
    pub status: StepStatus,

    #[serde(default)]
    pub attempts: Vec<FlowExecutionStepAttempt>,
}

impl FlowExecutionStepState {
    /// Number of trailing failed attempts.
    ///
    /// A step that succeeded or suspended in between starts counting afresh.
    pub fn consecutive_failures(&self) -> u32 {
        self.attempts
            .iter()
            .rev()
            .take_while(|a| a.is_failed())
            .count() as u32
    }

    /// Resume marker left by the last attempt, if it suspended.
    pub fn resume_marker(&self) -> Option<serde_json::Value> {
        match self.attempts.last().and_then(|a| a.outcome.as_ref()) {
            Some(AttemptOutcome::Suspended { marker, .. }) => marker.clone(),
            _ => None,
        }
    }

    /// Error of the most recent failed attempt.
    pub fn last_error(&self) -> Option<&str> {
        self.attempts.iter().rev().find_map(|a| a.error())
    }
}

/// Persisted progress record of one flow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowExecutionState {
    /// Triggering event payload plus values written by steps.
    #[serde(default)]
    pub context: FlowContext,

    pub created: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,

    /// Snapshot of the definition the instance was created from.
    pub definition: FlowDefinition,

    #[serde(default)]
    pub description: String,

    /// Step to run next. `None` once terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,

    pub status: FlowStatus,

    #[serde(default)]
    pub steps: BTreeMap<String, FlowExecutionStepState>,

    /// Reason for a failure that is not tied to a step attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FlowExecutionState {
    /// Create the initial state for a new instance.
    ///
    /// A non-object context is stored under the `event` key.
    pub fn new(definition: FlowDefinition, context: serde_json::Value, now: DateTime<Utc>) -> Self {
        let context = match context {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => FlowContext::new(),
            other => {
                let mut map = FlowContext::new();
                map.insert("event".to_string(), other);
                map
            }
        };

        let steps = definition
            .steps
            .keys()
            .map(|id| (id.clone(), FlowExecutionStepState::default()))
            .collect();

        Self {
            context,
            created: now,
            completed: None,
            description: definition
                .name
                .clone()
                .unwrap_or_else(|| definition.id.clone()),
            next_step_id: Some(definition.initial_step_id.clone()),
            status: FlowStatus::Running,
            steps,
            error: None,
            definition,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Step state, created on first access.
    pub fn step_mut(&mut self, step_id: &str) -> &mut FlowExecutionStepState {
        self.steps.entry(step_id.to_string()).or_default()
    }

    /// Enter a terminal status. Steps never entered become `Skipped`.
    pub fn finish(&mut self, status: FlowStatus, now: DateTime<Utc>) {
        self.status = status;
        self.completed = Some(now);
        self.next_step_id = None;

        for step in self.steps.values_mut() {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Skipped;
            }
        }
    }

    /// Fail the flow with a message that is not attached to an attempt.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.error = Some(message.into());
        self.finish(FlowStatus::Failed, now);
    }

    /// Total number of attempts across all steps.
    pub fn attempt_count(&self) -> usize {
        self.steps.values().map(|s| s.attempts.len()).sum()
    }
}
