//! Built-in step implementations.
//!
//! - `delay` - Suspend the flow for a fixed duration without holding a worker
//! - `webhook` - Call an HTTP endpoint with a templated request
//! - `set` - Write templated values into the flow context

mod delay;
mod set;
mod webhook;

pub use self::delay::{DelayConfig, DelayStep};
pub use self::set::{SetConfig, SetStep};
pub use self::webhook::{HttpMethod, WebhookConfig, WebhookStep, IDEMPOTENCY_HEADER};

use crate::registry::StepRegistry;

/// Create a step registry with all built-in steps registered.
pub fn create_default_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();

    registry.register(DelayStep::new());
    registry.register(WebhookStep::new());
    registry.register(SetStep::new());

    registry
}
