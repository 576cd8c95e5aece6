//! Flow definitions: the immutable step graph an instance follows.

use std::collections::BTreeMap;

use flow_steps::StepConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Problems with a definition's graph.
///
/// Raised by [`FlowDefinition::validate`] before a definition is stored, and
/// by the interpreter when a running instance hits a graph it cannot follow.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DefinitionError {
    #[error("Definition id must not be empty")]
    MissingId,

    #[error("Definition has no steps")]
    NoSteps,

    #[error("Initial step '{0}' does not exist")]
    MissingInitialStep(String),

    #[error("Step '{from}' references unknown step '{target}'")]
    DanglingStepId { from: String, target: String },

    #[error("Step '{0}' has more than one default branch")]
    MultipleDefaultBranches(String),

    #[error("Step '{0}' has an empty kind")]
    EmptyKind(String),

    #[error("Step '{0}' does not exist")]
    MissingStep(String),

    #[error("Step '{step_id}' uses unknown kind '{kind}'")]
    UnknownKind { step_id: String, kind: String },

    #[error("Condition of branch '{branch}' on step '{step_id}' failed: {message}")]
    Condition {
        step_id: String,
        branch: String,
        message: String,
    },
}

/// A flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Definition id. A changed graph gets a new id.
    pub id: String,

    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Step the flow starts with.
    pub initial_step_id: String,

    /// Steps keyed by step id.
    pub steps: BTreeMap<String, FlowStepDefinition>,
}

/// One node of the step graph.
///
/// Routing is either linear (`next_step_id`) or branching (`branches`, with
/// `no_match_step_id` as the fallback when no branch matches).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStepDefinition {
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Route onwards even if the step fails.
    #[serde(default)]
    pub ignore_error: bool,

    /// Step kind and its configuration.
    pub step: StepConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<FlowBranch>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_match_step_id: Option<String>,
}

/// A conditional edge out of a branching step.
///
/// A branch without a condition is the default ("else") branch. A sub-list
/// of steps is expressed by pointing `next_step_id` at its first step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowBranch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
}

/// Treat empty ids as "no next step".
pub(crate) fn non_empty(id: &Option<String>) -> Option<&str> {
    id.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl FlowBranch {
    /// Returns true for the unconditional branch.
    pub fn is_default(&self) -> bool {
        self.condition
            .as_deref()
            .map(|c| c.trim().is_empty())
            .unwrap_or(true)
    }

    /// Name used in logs and errors.
    pub fn label(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("#{}", index))
    }
}

impl FlowStepDefinition {
    /// Create a linear step.
    pub fn new(step: StepConfig) -> Self {
        Self {
            name: None,
            ignore_error: false,
            step,
            next_step_id: None,
            branches: Vec::new(),
            no_match_step_id: None,
        }
    }

    pub fn with_next(mut self, next_step_id: impl Into<String>) -> Self {
        self.next_step_id = Some(next_step_id.into());
        self
    }

    pub fn with_branch(mut self, branch: FlowBranch) -> Self {
        self.branches.push(branch);
        self
    }

    pub fn with_no_match(mut self, step_id: impl Into<String>) -> Self {
        self.no_match_step_id = Some(step_id.into());
        self
    }

    pub fn ignoring_errors(mut self) -> Self {
        self.ignore_error = true;
        self
    }

    /// Returns true if routing is decided by branches.
    pub fn is_branching(&self) -> bool {
        !self.branches.is_empty()
    }

    /// The unconditional branch, if any.
    pub fn default_branch(&self) -> Option<&FlowBranch> {
        self.branches.iter().find(|b| b.is_default())
    }

    /// Every step id this step can route to.
    fn targets(&self) -> impl Iterator<Item = &str> {
        non_empty(&self.next_step_id)
            .into_iter()
            .chain(self.branches.iter().filter_map(|b| non_empty(&b.next_step_id)))
            .chain(non_empty(&self.no_match_step_id))
    }
}

impl FlowBranch {
    /// Create a conditional branch.
    pub fn when(condition: impl Into<String>, next_step_id: impl Into<String>) -> Self {
        Self {
            name: None,
            condition: Some(condition.into()),
            next_step_id: Some(next_step_id.into()),
        }
    }

    /// Create the default branch.
    pub fn otherwise(next_step_id: impl Into<String>) -> Self {
        Self {
            name: None,
            condition: None,
            next_step_id: Some(next_step_id.into()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl FlowDefinition {
    /// Create a definition with no steps.
    pub fn new(id: impl Into<String>, initial_step_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            initial_step_id: initial_step_id.into(),
            steps: BTreeMap::new(),
        }
    }

    /// Add a step.
    pub fn with_step(mut self, id: impl Into<String>, step: FlowStepDefinition) -> Self {
        self.steps.insert(id.into(), step);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Look up a step.
    pub fn step(&self, id: &str) -> Option<&FlowStepDefinition> {
        self.steps.get(id)
    }

    /// Check the graph for structural errors.
    ///
    /// Cycles are allowed.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.id.trim().is_empty() {
            return Err(DefinitionError::MissingId);
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps);
        }
        if !self.steps.contains_key(&self.initial_step_id) {
            return Err(DefinitionError::MissingInitialStep(self.initial_step_id.clone()));
        }

        for (id, step) in &self.steps {
            if step.step.kind.trim().is_empty() {
                return Err(DefinitionError::EmptyKind(id.clone()));
            }
            if step.branches.iter().filter(|b| b.is_default()).count() > 1 {
                return Err(DefinitionError::MultipleDefaultBranches(id.clone()));
            }
            if let Some(target) = step.targets().find(|t| !self.steps.contains_key(*t)) {
                return Err(DefinitionError::DanglingStepId {
                    from: id.clone(),
                    target: target.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(kind: &str) -> FlowStepDefinition {
        FlowStepDefinition::new(StepConfig::new(kind, json!({})))
    }

    fn linear() -> FlowDefinition {
        FlowDefinition::new("notify-on-publish", "1")
            .with_step("1", step("delay").with_next("2"))
            .with_step("2", step("webhook"))
    }

    #[test]
    fn test_valid_definition() {
        assert_eq!(linear().validate(), Ok(()));
    }

    #[test]
    fn test_cycles_are_allowed() {
        let def = FlowDefinition::new("loop", "a")
            .with_step("a", step("set").with_next("b"))
            .with_step("b", step("set").with_next("a"));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_no_steps() {
        let def = FlowDefinition::new("empty", "1");
        assert_eq!(def.validate(), Err(DefinitionError::NoSteps));
    }

    #[test]
    fn test_missing_initial_step() {
        let mut def = linear();
        def.initial_step_id = "0".to_string();
        assert_eq!(
            def.validate(),
            Err(DefinitionError::MissingInitialStep("0".to_string()))
        );
    }

    #[test]
    fn test_dangling_branch_target() {
        let def = FlowDefinition::new("branchy", "1")
            .with_step("1", step("set").with_branch(FlowBranch::when("x", "9")));
        assert_eq!(
            def.validate(),
            Err(DefinitionError::DanglingStepId {
                from: "1".to_string(),
                target: "9".to_string()
            })
        );
    }

    #[test]
    fn test_empty_next_step_is_terminal() {
        let def = FlowDefinition::new("one", "1").with_step("1", step("set").with_next(""));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_multiple_default_branches() {
        let def = FlowDefinition::new("branchy", "1")
            .with_step(
                "1",
                step("set")
                    .with_branch(FlowBranch::otherwise("2"))
                    .with_branch(FlowBranch::otherwise("2")),
            )
            .with_step("2", step("set"));
        assert_eq!(
            def.validate(),
            Err(DefinitionError::MultipleDefaultBranches("1".to_string()))
        );
    }

    #[test]
    fn test_empty_kind() {
        let def = FlowDefinition::new("blank", "1").with_step("1", step(" "));
        assert_eq!(def.validate(), Err(DefinitionError::EmptyKind("1".to_string())));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
id: notify-on-publish
name: Notify on publish
initial_step_id: "1"
steps:
  "1":
    step:
      kind: delay
      seconds: 30
    next_step_id: "2"
  "2":
    ignore_error: true
    step:
      kind: webhook
      url: https://example.com/hook
      retry:
        max_attempts: 3
    branches:
      - name: published
        condition: event.type == 'Published'
        next_step_id: "1"
"#;
        let def = FlowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(def.name.as_deref(), Some("Notify on publish"));
        assert_eq!(def.steps["1"].step.config["seconds"], json!(30));
        assert!(def.steps["2"].ignore_error);
        assert_eq!(def.steps["2"].step.retry.as_ref().map(|r| r.max_attempts), Some(3));
        assert!(def.steps["2"].is_branching());
        assert!(def.validate().is_ok());
    }
}
