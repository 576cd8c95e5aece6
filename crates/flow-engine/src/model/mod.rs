//! Flow data model.
//!
//! - [`definition`]: immutable step graphs
//! - [`state`]: the persisted progress record of one instance
//! - [`flow`]: the durable flow row
//! - [`cron`]: generic cron job rows

pub mod cron;
pub mod definition;
pub mod flow;
pub mod state;

pub use cron::{CronJob, CronJobData};
pub use definition::{DefinitionError, FlowBranch, FlowDefinition, FlowStepDefinition};
pub use flow::Flow;
pub use state::{
    AttemptOutcome, FlowExecutionState, FlowExecutionStepAttempt, FlowExecutionStepState,
    FlowStatus, StepStatus,
};
