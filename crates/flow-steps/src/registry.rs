//! Step registry and dispatch.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::StepContext;
use crate::error::StepError;
use crate::outcome::StepOutcome;

/// Configuration of one step in a flow definition.
///
/// Serialized as a tagged union: `kind` selects the executor and every other
/// field except `timeout` and `retry` is the kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Step kind (e.g., "delay", "webhook", "set").
    pub kind: String,

    /// Kind-specific configuration.
    #[serde(flatten)]
    pub config: serde_json::Value,

    /// Timeout in seconds (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Retry configuration (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl StepConfig {
    /// Create a step config of the given kind.
    pub fn new(kind: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            config,
            timeout: None,
            retry: None,
        }
    }

    /// Set the timeout in seconds.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    /// Set the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Deserialize the kind-specific payload.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        serde_json::from_value(self.config.clone()).map_err(|e| {
            StepError::Configuration(format!("invalid '{}' step configuration: {}", self.kind, e))
        })
    }
}

/// Retry configuration for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    600_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Executable capability behind a step kind.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Returns the step's kind.
    fn kind(&self) -> &'static str;

    /// Whether the executor honours [`StepContext::dry_run`].
    ///
    /// Simulation replaces executors that return `false` with a no-op.
    fn supports_dry_run(&self) -> bool {
        false
    }

    /// Execute one attempt of the step.
    async fn execute(
        &self,
        config: &StepConfig,
        ctx: &StepContext,
    ) -> Result<StepOutcome, StepError>;
}

/// Registry of available step executors.
#[derive(Clone)]
pub struct StepRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    /// Create a new empty step registry.
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor under its own kind.
    pub fn register<T: StepExecutor + 'static>(&mut self, executor: T) {
        let name = executor.kind().to_string();
        self.executors.insert(name, Arc::new(executor));
    }

    /// Register a shared executor under an explicit kind name.
    pub fn register_as(&mut self, kind: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(kind.into(), executor);
    }

    /// Get an executor by kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(kind).cloned()
    }

    /// Check if a kind is registered.
    pub fn has(&self, kind: &str) -> bool {
        self.executors.contains_key(kind)
    }

    /// List all registered kinds, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Execute a step using `config.kind` to pick the executor.
    pub async fn execute(
        &self,
        config: &StepConfig,
        ctx: &StepContext,
    ) -> Result<StepOutcome, StepError> {
        let executor = self
            .get(&config.kind)
            .ok_or_else(|| StepError::NotFound(config.kind.clone()))?;
        executor.execute(config, ctx).await
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("executors", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    struct MockStep;

    #[async_trait]
    impl StepExecutor for MockStep {
        fn kind(&self) -> &'static str {
            "mock"
        }

        async fn execute(
            &self,
            _config: &StepConfig,
            _ctx: &StepContext,
        ) -> Result<StepOutcome, StepError> {
            Ok(StepOutcome::completed().with_log("mock ran"))
        }
    }

    fn ctx() -> StepContext {
        StepContext::new(Uuid::new_v4(), "1", Utc::now())
    }

    #[test]
    fn test_registry_new() {
        let registry = StepRegistry::new();
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_registry_register() {
        let mut registry = StepRegistry::new();
        registry.register(MockStep);
        registry.register_as("alias", Arc::new(MockStep));

        assert!(registry.has("mock"));
        assert!(registry.has("alias"));
        assert!(!registry.has("unknown"));
        assert_eq!(registry.list(), vec!["alias", "mock"]);
    }

    #[tokio::test]
    async fn test_registry_execute() {
        let mut registry = StepRegistry::new();
        registry.register(MockStep);

        let config = StepConfig::new("mock", serde_json::json!({}));
        let outcome = registry.execute(&config, &ctx()).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.log(), ["mock ran".to_string()]);
    }

    #[tokio::test]
    async fn test_registry_execute_not_found() {
        let registry = StepRegistry::new();
        let config = StepConfig::new("unknown", serde_json::json!({}));

        let result = registry.execute(&config, &ctx()).await;
        assert!(matches!(result, Err(StepError::NotFound(_))));
    }

    #[test]
    fn test_step_config_flattened_payload() {
        let config: StepConfig = serde_json::from_value(serde_json::json!({
            "kind": "webhook",
            "url": "https://example.com/hook",
            "timeout": 10,
            "retry": {"max_attempts": 3}
        }))
        .unwrap();

        assert_eq!(config.kind, "webhook");
        assert_eq!(config.timeout, Some(10));
        assert_eq!(config.retry.as_ref().map(|r| r.max_attempts), Some(3));
        assert_eq!(config.config["url"], "https://example.com/hook");
        assert!(config.config.get("kind").is_none());
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay_ms, 2000);
        assert_eq!(config.max_delay_ms, 600_000);
        assert_eq!(config.backoff_multiplier, 2.0);
    }
}
