//! Side-effect free simulation.
//!
//! Walks a definition against one sample event without touching the store.
//! Steps run in dry-run mode, executors that cannot honour dry-run are
//! replaced by a no-op, and waits advance a virtual clock instead of
//! sleeping. The result has the same [`FlowExecutionState`] shape as a live
//! flow, or a [`SkipReason`] when the flow would never have started.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flow_steps::{StepConfig, StepContext, StepError, StepExecutor, StepOutcome, StepRegistry};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::engine::{Clock, Interpreter, ManualClock};
use crate::model::{FlowDefinition, FlowExecutionState};

/// Why a flow did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    ConditionDoesNotMatch,
    ConditionPrecheckDoesNotMatch,
    Disabled,
    Failed,
    FromRule,
    NoAction,
    NoTrigger,
    TooOld,
    WrongEvent,
    WrongEventForTrigger,
}

/// Trigger attached to the simulated owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Event category the trigger listens to.
    pub trigger_type: String,

    /// Accepted event types. Empty accepts all.
    #[serde(default)]
    pub event_types: Vec<String>,

    /// Cheap condition over the event envelope (no payload).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precheck: Option<String>,

    /// Condition over the full event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<u64>,
}

/// Sample event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationEvent {
    pub category: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,

    /// Owner whose flow produced this event, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_owner_id: Option<String>,

    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SimulationEvent {
    fn envelope(&self) -> serde_json::Value {
        json!({
            "event": {
                "category": self.category,
                "event_type": self.event_type,
                "timestamp": self.timestamp,
                "origin_owner_id": self.origin_owner_id,
            }
        })
    }

    fn full(&self) -> serde_json::Value {
        json!({
            "event": {
                "category": self.category,
                "event_type": self.event_type,
                "timestamp": self.timestamp,
                "origin_owner_id": self.origin_owner_id,
                "payload": self.payload,
            }
        })
    }
}

fn default_enabled() -> bool {
    true
}

/// Input of one simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub definition: FlowDefinition,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerSpec>,

    pub event: SimulationEvent,

    #[serde(default)]
    pub owner_id: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Output of one simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<FlowExecutionState>,

    /// Interpreter invocations performed.
    pub steps_executed: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SimulationResult {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skip_reason: Some(reason),
            state: None,
            steps_executed: 0,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            skip_reason: Some(SkipReason::Failed),
            state: None,
            steps_executed: 0,
            error: Some(error.into()),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skip_reason.is_some()
    }
}

/// Stand-in for executors that cannot run without side effects.
struct NoOpStep;

#[async_trait]
impl StepExecutor for NoOpStep {
    fn kind(&self) -> &'static str {
        "noop"
    }

    fn supports_dry_run(&self) -> bool {
        true
    }

    async fn execute(&self, config: &StepConfig, _ctx: &StepContext) -> Result<StepOutcome, StepError> {
        Ok(StepOutcome::completed().with_log(format!("Simulated '{}' step", config.kind)))
    }
}

/// Runs simulations with the executors of a live interpreter.
#[derive(Debug, Clone)]
pub struct Simulator {
    interpreter: Interpreter,
    max_steps: usize,
}

impl Simulator {
    /// Build a simulator from a live interpreter.
    ///
    /// The interpreter's registry is copied with every executor lacking
    /// dry-run support swapped for a no-op. Retry delays lose their jitter.
    pub fn new(interpreter: &Interpreter, max_steps: usize) -> Self {
        let live = interpreter.registry();
        let noop: Arc<dyn StepExecutor> = Arc::new(NoOpStep);

        let mut registry = StepRegistry::new();
        for kind in live.list() {
            match live.get(kind) {
                Some(executor) if executor.supports_dry_run() => registry.register_as(kind, executor),
                _ => registry.register_as(kind, noop.clone()),
            }
        }

        let retry_policy = interpreter.retry_policy().without_jitter();
        let interpreter = interpreter
            .clone()
            .with_registry(registry)
            .with_retry_policy(retry_policy)
            .with_retry_jitter(0.0)
            .with_dry_run(true)
            .with_instance_deadline(None);

        Self {
            interpreter,
            max_steps,
        }
    }

    /// Simulate `request` as if the event arrived right now.
    pub async fn run(&self, request: &SimulationRequest) -> SimulationResult {
        let now = self.interpreter.clock().now();
        self.simulate(request, now).await
    }

    /// Simulate `request` as if the event arrived at `now`.
    ///
    /// Never returns an error: internal problems come back as
    /// [`SkipReason::Failed`].
    pub async fn simulate(&self, request: &SimulationRequest, now: DateTime<Utc>) -> SimulationResult {
        if let Some(reason) = self.skip_reason(request, now) {
            tracing::debug!(owner_id = %request.owner_id, ?reason, "Simulation skipped");
            return match reason {
                Err(e) => SimulationResult::failed(e),
                Ok(reason) => SimulationResult::skipped(reason),
            };
        }

        let clock = Arc::new(ManualClock::new(now));
        let interpreter = self.interpreter.clone().with_clock(clock.clone());

        let flow_id = Uuid::nil();
        let mut state = FlowExecutionState::new(request.definition.clone(), request.event.full(), now);
        let mut steps_executed = 0;

        while !state.is_terminal() {
            if steps_executed >= self.max_steps {
                state.fail(
                    format!("Simulation stopped after {} steps", self.max_steps),
                    clock.now(),
                );
                break;
            }

            let transition = interpreter.advance(flow_id, &state).await;
            steps_executed += 1;

            if let Some(due) = transition.due_time {
                if due > clock.now() {
                    clock.set(due);
                }
            }
            state = transition.state;
        }

        tracing::debug!(
            definition_id = %request.definition.id,
            status = %state.status,
            steps_executed,
            "Simulation finished"
        );

        SimulationResult {
            skip_reason: None,
            state: Some(state),
            steps_executed,
            error: None,
        }
    }

    /// First reason the flow would not start. `Err` for evaluation problems.
    fn skip_reason(
        &self,
        request: &SimulationRequest,
        now: DateTime<Utc>,
    ) -> Option<Result<SkipReason, String>> {
        if !request.enabled {
            return Some(Ok(SkipReason::Disabled));
        }
        let Some(trigger) = &request.trigger else {
            return Some(Ok(SkipReason::NoTrigger));
        };
        if request.definition.steps.is_empty() {
            return Some(Ok(SkipReason::NoAction));
        }
        if let Err(e) = request.definition.validate() {
            return Some(Err(e.to_string()));
        }

        let event = &request.event;
        if !event.category.eq_ignore_ascii_case(&trigger.trigger_type) {
            return Some(Ok(SkipReason::WrongEvent));
        }
        if !trigger.event_types.is_empty() && !trigger.event_types.contains(&event.event_type) {
            return Some(Ok(SkipReason::WrongEventForTrigger));
        }
        if !request.owner_id.is_empty()
            && event.origin_owner_id.as_deref() == Some(request.owner_id.as_str())
        {
            return Some(Ok(SkipReason::FromRule));
        }
        if let Some(max_age) = trigger.max_age_seconds {
            let max_age = chrono::Duration::seconds(max_age.min(i64::MAX as u64) as i64);
            if now - event.timestamp > max_age {
                return Some(Ok(SkipReason::TooOld));
            }
        }

        let evaluator = self.interpreter.evaluator();
        let checks = [
            (&trigger.precheck, event.envelope(), SkipReason::ConditionPrecheckDoesNotMatch),
            (&trigger.condition, event.full(), SkipReason::ConditionDoesNotMatch),
        ];
        for (condition, context, reason) in checks {
            let Some(condition) = condition.as_deref().filter(|c| !c.trim().is_empty()) else {
                continue;
            };
            match evaluator.evaluate(condition, &context) {
                Ok(true) => {}
                Ok(false) => return Some(Ok(reason)),
                Err(e) => return Some(Err(format!("Invalid condition '{}': {}", condition, e))),
            }
        }

        None
    }
}
