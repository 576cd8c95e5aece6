//! Flow interpreter.
//!
//! Advances a flow by exactly one step attempt. The input state is never
//! mutated; the caller persists the returned [`Transition`] wholesale.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flow_steps::{FlowContext, StepContext, StepError, StepOutcome, StepRegistry};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::evaluator::{ConditionEvaluator, JinjaConditionEvaluator};
use super::retry::{ExponentialBackoff, RetryPolicy};
use crate::config::EngineConfig;
use crate::model::definition::non_empty;
use crate::model::{
    AttemptOutcome, DefinitionError, Flow, FlowExecutionState, FlowExecutionStepAttempt,
    FlowStatus, FlowStepDefinition, StepStatus,
};

/// Result of one interpreter invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: FlowExecutionState,
    /// When the flow should be claimed next. `None` once terminal.
    pub due_time: Option<DateTime<Utc>>,
}

impl Transition {
    fn terminal(state: FlowExecutionState) -> Self {
        Self {
            state,
            due_time: None,
        }
    }
}

/// The flow state machine.
#[derive(Clone)]
pub struct Interpreter {
    registry: StepRegistry,
    evaluator: Arc<dyn ConditionEvaluator>,
    retry_policy: Arc<dyn RetryPolicy>,
    retry_jitter: f64,
    step_timeout: Duration,
    instance_deadline: Option<chrono::Duration>,
    dry_run: bool,
    clock: Arc<dyn Clock>,
}

impl Interpreter {
    /// Create an interpreter with default policies and the system clock.
    pub fn new(registry: StepRegistry) -> Self {
        Self::from_config(registry, &EngineConfig::default(), Arc::new(SystemClock))
    }

    /// Create an interpreter from engine configuration.
    pub fn from_config(registry: StepRegistry, config: &EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            evaluator: Arc::new(JinjaConditionEvaluator::new()),
            retry_policy: Arc::new(config.retry_policy()),
            retry_jitter: config.retry_jitter,
            step_timeout: config.step_timeout(),
            instance_deadline: config.instance_deadline(),
            dry_run: false,
            clock,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Jitter applied to per-step retry overrides.
    pub fn with_retry_jitter(mut self, jitter: f64) -> Self {
        self.retry_jitter = jitter.max(0.0);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_instance_deadline(mut self, deadline: Option<chrono::Duration>) -> Self {
        self.instance_deadline = deadline;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run steps with side effects suppressed.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Replace the step registry, keeping every other setting.
    pub fn with_registry(mut self, registry: StepRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn retry_policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.retry_policy
    }

    pub fn evaluator(&self) -> &Arc<dyn ConditionEvaluator> {
        &self.evaluator
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Advance a stored flow and return the updated row.
    ///
    /// The version is left untouched; the store bumps it on persist.
    pub async fn advance_flow(&self, flow: &Flow) -> Flow {
        let transition = self.advance(flow.id, &flow.state).await;
        Flow {
            state: transition.state,
            due_time: transition.due_time,
            ..flow.clone()
        }
    }

    /// Execute the current step once and compute the next state.
    pub async fn advance(&self, flow_id: Uuid, current: &FlowExecutionState) -> Transition {
        let mut state = current.clone();
        let now = self.clock.now();

        if state.is_terminal() {
            tracing::debug!(%flow_id, status = %state.status, "Flow already terminal, nothing to do");
            return Transition::terminal(state);
        }

        if let Some(deadline) = self.instance_deadline {
            if now - state.created > deadline {
                state.fail(
                    format!("Flow exceeded its deadline of {}s", deadline.num_seconds()),
                    now,
                );
                tracing::warn!(%flow_id, "Flow deadline exceeded");
                return Transition::terminal(state);
            }
        }

        let Some(step_id) = state.next_step_id.clone() else {
            return Self::definition_failure(flow_id, state, DefinitionError::MissingStep(String::new()), now);
        };
        let Some(step_def) = state.definition.step(&step_id).cloned() else {
            return Self::definition_failure(flow_id, state, DefinitionError::MissingStep(step_id), now);
        };
        let Some(executor) = self.registry.get(&step_def.step.kind) else {
            state.step_mut(&step_id).status = StepStatus::Failed;
            let error = DefinitionError::UnknownKind {
                step_id,
                kind: step_def.step.kind.clone(),
            };
            return Self::definition_failure(flow_id, state, error, now);
        };

        let step_state = state.step_mut(&step_id);
        let attempt = step_state.attempts.len();
        let resume = step_state.resume_marker();
        step_state.status = StepStatus::Running;
        step_state.attempts.push(FlowExecutionStepAttempt::started(now));

        let ctx = StepContext::new(flow_id, step_id.as_str(), now)
            .with_attempt(attempt)
            .with_variables(state.context.clone())
            .with_resume(resume)
            .with_dry_run(self.dry_run);

        let timeout_secs = step_def.step.timeout.unwrap_or(self.step_timeout.as_secs());
        let outcome = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            executor.execute(&step_def.step, &ctx),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => StepOutcome::failed(e.to_string()),
            Err(_) => StepOutcome::failed(StepError::Timeout(timeout_secs).to_string()),
        };

        let finished = self.clock.now();
        tracing::debug!(
            %flow_id,
            step_id = %step_id,
            attempt,
            completed = outcome.is_completed(),
            suspended = outcome.is_suspended(),
            "Step attempt finished"
        );

        match outcome {
            StepOutcome::Completed { output, log } => {
                Self::close_attempt(&mut state, &step_id, finished, AttemptOutcome::Succeeded, log);
                state.step_mut(&step_id).status = StepStatus::Completed;
                merge_context(&mut state.context, output);
                self.route(flow_id, state, &step_id, &step_def, finished)
            }
            StepOutcome::Suspended {
                resume_after,
                marker,
                log,
            } => {
                let Some(until) = add_delay(finished, resume_after) else {
                    let error = format!("Suspension of {}s is out of range", resume_after.as_secs());
                    return Self::out_of_range(flow_id, state, &step_id, error, log, finished);
                };
                Self::close_attempt(
                    &mut state,
                    &step_id,
                    finished,
                    AttemptOutcome::Suspended { until, marker },
                    log,
                );
                state.status = FlowStatus::Scheduled;
                Transition {
                    state,
                    due_time: Some(until),
                }
            }
            StepOutcome::Failed { error, log } => {
                Self::close_attempt(
                    &mut state,
                    &step_id,
                    finished,
                    AttemptOutcome::Failed {
                        error: error.clone(),
                    },
                    log,
                );

                if step_def.ignore_error {
                    state.step_mut(&step_id).status = StepStatus::Failed;
                    tracing::debug!(%flow_id, step_id = %step_id, "Ignoring step error");
                    return self.route(flow_id, state, &step_id, &step_def, finished);
                }

                let failures = state.step_mut(&step_id).consecutive_failures();
                let next_retry = match step_def.step.retry {
                    Some(ref retry) => {
                        ExponentialBackoff::from_config(retry, self.retry_jitter).next_retry(failures)
                    }
                    None => self.retry_policy.next_retry(failures),
                };

                match next_retry {
                    Some(delay) => {
                        let Some(due) = add_delay(finished, delay) else {
                            let error = format!("Retry delay of {}s is out of range", delay.as_secs());
                            return Self::out_of_range(flow_id, state, &step_id, error, Vec::new(), finished);
                        };
                        tracing::info!(
                            %flow_id,
                            step_id = %step_id,
                            failures,
                            retry_at = %due,
                            error = %error,
                            "Step failed, retry scheduled"
                        );
                        state.status = FlowStatus::Scheduled;
                        Transition {
                            state,
                            due_time: Some(due),
                        }
                    }
                    None => {
                        tracing::warn!(
                            %flow_id,
                            step_id = %step_id,
                            failures,
                            error = %error,
                            "Step failed, attempts exhausted"
                        );
                        state.step_mut(&step_id).status = StepStatus::Failed;
                        state.fail(
                            format!("Step '{}' failed after {} attempt(s): {}", step_id, failures, error),
                            finished,
                        );
                        Transition::terminal(state)
                    }
                }
            }
        }
    }

    /// Pick the next step after `step_id` finished (or failed with `ignore_error`).
    fn route(
        &self,
        flow_id: Uuid,
        mut state: FlowExecutionState,
        step_id: &str,
        step_def: &FlowStepDefinition,
        now: DateTime<Utc>,
    ) -> Transition {
        let next = match self.resolve_next(step_id, step_def, &state.context) {
            Ok(next) => next,
            Err(e) => return Self::definition_failure(flow_id, state, e, now),
        };

        let line = match &next {
            Some(next) => format!("Next step: {}", next),
            None => "End of flow".to_string(),
        };
        if let Some(attempt) = state.step_mut(step_id).attempts.last_mut() {
            attempt.log.push(line);
        }

        match next {
            Some(next) => {
                state.next_step_id = Some(next);
                state.status = FlowStatus::Running;
                Transition {
                    state,
                    due_time: Some(now),
                }
            }
            None => {
                tracing::info!(%flow_id, "Flow completed");
                state.finish(FlowStatus::Completed, now);
                Transition::terminal(state)
            }
        }
    }

    /// Resolve routing: conditional branches in order, then the default
    /// branch, then the no-match step.
    fn resolve_next(
        &self,
        step_id: &str,
        step_def: &FlowStepDefinition,
        context: &FlowContext,
    ) -> Result<Option<String>, DefinitionError> {
        if !step_def.is_branching() {
            return Ok(non_empty(&step_def.next_step_id).map(str::to_string));
        }

        let value = serde_json::Value::Object(context.clone());
        for (index, branch) in step_def.branches.iter().enumerate() {
            if branch.is_default() {
                continue;
            }
            let condition = branch.condition.as_deref().unwrap_or_default();
            let matched = self
                .evaluator
                .evaluate(condition, &value)
                .map_err(|e| DefinitionError::Condition {
                    step_id: step_id.to_string(),
                    branch: branch.label(index),
                    message: e.to_string(),
                })?;
            if matched {
                return Ok(non_empty(&branch.next_step_id).map(str::to_string));
            }
        }

        if let Some(default) = step_def.default_branch() {
            return Ok(non_empty(&default.next_step_id).map(str::to_string));
        }

        Ok(non_empty(&step_def.no_match_step_id)
            .or_else(|| non_empty(&step_def.next_step_id))
            .map(str::to_string))
    }

    fn close_attempt(
        state: &mut FlowExecutionState,
        step_id: &str,
        at: DateTime<Utc>,
        outcome: AttemptOutcome,
        log: Vec<String>,
    ) {
        if let Some(attempt) = state.step_mut(step_id).attempts.last_mut() {
            attempt.finish(at, outcome, log);
        }
    }

    /// A step asked for a wake-up time that cannot be represented.
    fn out_of_range(
        flow_id: Uuid,
        mut state: FlowExecutionState,
        step_id: &str,
        error: String,
        log: Vec<String>,
        now: DateTime<Utc>,
    ) -> Transition {
        tracing::warn!(%flow_id, step_id = %step_id, error = %error, "Step scheduling failed");
        let step = state.step_mut(step_id);
        step.status = StepStatus::Failed;
        if let Some(attempt) = step.attempts.last_mut() {
            if attempt.completed.is_none() {
                attempt.finish(now, AttemptOutcome::Failed { error: error.clone() }, log);
            } else {
                attempt.log.push(error.clone());
            }
        }
        state.fail(error, now);
        Transition::terminal(state)
    }

    fn definition_failure(
        flow_id: Uuid,
        mut state: FlowExecutionState,
        error: DefinitionError,
        now: DateTime<Utc>,
    ) -> Transition {
        tracing::warn!(%flow_id, error = %error, "Flow failed on definition error");
        state.fail(error.to_string(), now);
        Transition::terminal(state)
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("registry", &self.registry)
            .field("retry_policy", &self.retry_policy)
            .field("step_timeout", &self.step_timeout)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

fn merge_context(context: &mut FlowContext, output: FlowContext) {
    for (key, value) in output {
        context.insert(key, value);
    }
}

fn add_delay(at: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_add_signed(delay))
}
