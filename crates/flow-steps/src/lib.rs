//! Flowline Step Library
//!
//! Step execution contract shared by the flow engine and its workers.
//!
//! This crate provides:
//! - The [`StepExecutor`] trait and a [`StepRegistry`] keyed by step kind
//! - [`StepContext`] and [`StepOutcome`], the input and output of one step attempt
//! - Built-in steps: `delay`, `webhook`, `set`
//! - Template engine with Jinja2-compatible syntax, also used for branch conditions

pub mod context;
pub mod error;
pub mod outcome;
pub mod registry;
pub mod steps;
pub mod template;

pub use context::{FlowContext, StepContext};
pub use error::StepError;
pub use outcome::StepOutcome;
pub use registry::{RetryConfig, StepConfig, StepExecutor, StepRegistry};
pub use template::TemplateEngine;
