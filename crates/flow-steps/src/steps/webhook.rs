//! Webhook step.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::context::{FlowContext, StepContext};
use crate::error::StepError;
use crate::outcome::StepOutcome;
use crate::registry::{StepConfig, StepExecutor};
use crate::template::TemplateEngine;

/// Header carrying the attempt's idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// HTTP method.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
#[allow(clippy::upper_case_acronyms)]
pub enum HttpMethod {
    GET,
    #[default]
    POST,
    PUT,
    PATCH,
    DELETE,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::GET => Method::GET,
            HttpMethod::POST => Method::POST,
            HttpMethod::PUT => Method::PUT,
            HttpMethod::PATCH => Method::PATCH,
            HttpMethod::DELETE => Method::DELETE,
        }
    }
}

/// Webhook step configuration. String fields may contain templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// URL to call.
    pub url: String,

    /// HTTP method (default: POST).
    #[serde(default)]
    pub method: HttpMethod,

    /// Request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// JSON body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,

    /// Context key receiving `{status, body}` of the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Webhook step.
pub struct WebhookStep {
    client: reqwest::Client,
    template_engine: TemplateEngine,
}

impl WebhookStep {
    /// Create a new webhook step.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self::with_client(client)
    }

    /// Create a webhook step with a custom client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            template_engine: TemplateEngine::new(),
        }
    }

    fn render(&self, config: &WebhookConfig, ctx: &StepContext) -> Result<WebhookConfig, StepError> {
        let template_ctx = ctx.to_template_context();

        let mut headers = HashMap::with_capacity(config.headers.len());
        for (key, value) in &config.headers {
            headers.insert(key.clone(), self.template_engine.render(value, &template_ctx)?);
        }

        let body = config
            .body
            .as_ref()
            .map(|b| self.template_engine.render_value(b, &template_ctx))
            .transpose()?;

        Ok(WebhookConfig {
            url: self.template_engine.render(&config.url, &template_ctx)?,
            method: config.method,
            headers,
            body,
            output: config.output.clone(),
        })
    }
}

impl Default for WebhookStep {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WebhookStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookStep").finish_non_exhaustive()
    }
}

#[async_trait]
impl StepExecutor for WebhookStep {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    fn supports_dry_run(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        config: &StepConfig,
        ctx: &StepContext,
    ) -> Result<StepOutcome, StepError> {
        let webhook: WebhookConfig = config.parse()?;
        let request = self.render(&webhook, ctx)?;
        let method: Method = request.method.into();

        if ctx.dry_run {
            return Ok(StepOutcome::completed().with_log(format!("dry run: {} {}", method, request.url)));
        }

        tracing::debug!(
            flow_id = %ctx.flow_id,
            step_id = %ctx.step_id,
            url = %request.url,
            "Calling webhook"
        );

        let mut builder = self
            .client
            .request(method.clone(), &request.url)
            .header(IDEMPOTENCY_HEADER, ctx.idempotency_key());
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let line = format!("{} {} -> {}", method, request.url, status.as_u16());

        if !status.is_success() {
            return Ok(StepOutcome::failed(format!(
                "webhook returned {}: {}",
                status.as_u16(),
                text
            ))
            .with_log(line));
        }

        let mut output = FlowContext::new();
        if let Some(key) = request.output {
            let body: serde_json::Value =
                serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
            output.insert(
                key,
                serde_json::json!({ "status": status.as_u16(), "body": body }),
            );
        }

        Ok(StepOutcome::completed_with(output).with_log(line))
    }
}
