//! Execution context for step attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Flow context: the triggering event payload plus values written by steps.
pub type FlowContext = serde_json::Map<String, serde_json::Value>;

/// Context passed to a step executor for a single attempt.
///
/// Contains everything a step needs to run:
/// - Flow and step identity, and the attempt index
/// - The current flow context
/// - The resume marker left by a previous suspension of the same step
/// - Whether side effects must be suppressed (simulation)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepContext {
    /// Flow instance ID.
    pub flow_id: Uuid,

    /// Step ID within the flow definition.
    pub step_id: String,

    /// Zero-based index of this attempt within the step's attempt list.
    pub attempt: usize,

    /// Clock reading for this attempt.
    pub now: DateTime<Utc>,

    /// Flow context variables.
    #[serde(default)]
    pub variables: FlowContext,

    /// Marker returned by the last suspension of this step, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume: Option<serde_json::Value>,

    /// Suppress externally visible side effects.
    #[serde(default)]
    pub dry_run: bool,
}

impl StepContext {
    /// Create a new step context.
    pub fn new(flow_id: Uuid, step_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            flow_id,
            step_id: step_id.into(),
            attempt: 0,
            now,
            variables: FlowContext::new(),
            resume: None,
            dry_run: false,
        }
    }

    /// Set the attempt index.
    pub fn with_attempt(mut self, attempt: usize) -> Self {
        self.attempt = attempt;
        self
    }

    /// Set the flow context variables.
    pub fn with_variables(mut self, variables: FlowContext) -> Self {
        self.variables = variables;
        self
    }

    /// Set the resume marker.
    pub fn with_resume(mut self, resume: Option<serde_json::Value>) -> Self {
        self.resume = resume;
        self
    }

    /// Mark the attempt as a dry run.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Get a variable value.
    pub fn get_variable(&self, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(name)
    }

    /// Stable key for deduplicating side effects of this attempt.
    ///
    /// A crashed attempt is re-run with the same index, so the key survives
    /// reclaims.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.flow_id, self.step_id, self.attempt)
    }

    /// Convert context to a template context.
    pub fn to_template_context(&self) -> serde_json::Value {
        let mut ctx = self.variables.clone();

        ctx.insert(
            "flow".to_string(),
            serde_json::json!({
                "id": self.flow_id.to_string(),
                "step": self.step_id,
                "attempt": self.attempt,
                "now": self.now.to_rfc3339(),
            }),
        );

        serde_json::Value::Object(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow_id() -> Uuid {
        Uuid::parse_str("6f1c2a8e-4b0d-4c47-9d3e-0f5a7b1c2d3e").unwrap()
    }

    #[test]
    fn test_context_new() {
        let now = Utc::now();
        let ctx = StepContext::new(flow_id(), "notify", now);
        assert_eq!(ctx.step_id, "notify");
        assert_eq!(ctx.attempt, 0);
        assert!(!ctx.dry_run);
        assert!(ctx.resume.is_none());
    }

    #[test]
    fn test_idempotency_key() {
        let ctx = StepContext::new(flow_id(), "notify", Utc::now()).with_attempt(2);
        assert_eq!(
            ctx.idempotency_key(),
            "6f1c2a8e-4b0d-4c47-9d3e-0f5a7b1c2d3e:notify:2"
        );
    }

    #[test]
    fn test_context_to_template() {
        let mut variables = FlowContext::new();
        variables.insert("schema".to_string(), serde_json::json!("blog"));

        let ctx = StepContext::new(flow_id(), "notify", Utc::now()).with_variables(variables);
        let template_ctx = ctx.to_template_context();

        assert_eq!(template_ctx["schema"], serde_json::json!("blog"));
        assert_eq!(template_ctx["flow"]["step"], serde_json::json!("notify"));
        assert_eq!(ctx.get_variable("schema"), Some(&serde_json::json!("blog")));
    }
}
