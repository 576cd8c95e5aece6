//! Set step: writes templated values into the flow context.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::{FlowContext, StepContext};
use crate::error::StepError;
use crate::outcome::StepOutcome;
use crate::registry::{StepConfig, StepExecutor};
use crate::template::TemplateEngine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetConfig {
    /// Keys to write. Values may contain templates.
    #[serde(default)]
    pub values: FlowContext,
}

#[derive(Debug, Default)]
pub struct SetStep {
    template_engine: TemplateEngine,
}

impl SetStep {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepExecutor for SetStep {
    fn kind(&self) -> &'static str {
        "set"
    }

    fn supports_dry_run(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        config: &StepConfig,
        ctx: &StepContext,
    ) -> Result<StepOutcome, StepError> {
        let set: SetConfig = config.parse()?;
        let template_ctx = ctx.to_template_context();

        let mut output = FlowContext::new();
        for (key, value) in &set.values {
            output.insert(key.clone(), self.template_engine.render_value(value, &template_ctx)?);
        }

        let line = format!("Set {} value(s)", output.len());
        Ok(StepOutcome::completed_with(output).with_log(line))
    }
}
