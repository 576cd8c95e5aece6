//! Branch condition evaluation.
//!
//! The interpreter treats conditions as opaque predicates over the flow
//! context. The default evaluator reads them as Jinja expressions.

use flow_steps::TemplateEngine;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConditionError(pub String);

/// Evaluates a branch condition against the flow context.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, condition: &str, context: &serde_json::Value) -> Result<bool, ConditionError>;
}

/// Jinja expression evaluator, e.g. `event.type == 'Published' and event.count > 1`.
#[derive(Debug, Default)]
pub struct JinjaConditionEvaluator {
    engine: TemplateEngine,
}

impl JinjaConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConditionEvaluator for JinjaConditionEvaluator {
    fn evaluate(&self, condition: &str, context: &serde_json::Value) -> Result<bool, ConditionError> {
        self.engine
            .evaluate_condition(condition, context)
            .map_err(|e| ConditionError(e.to_string()))
    }
}
