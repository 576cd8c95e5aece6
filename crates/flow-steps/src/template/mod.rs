//! Template engine module.
//!
//! Provides Jinja2-compatible template rendering and expression evaluation
//! using minijinja.

mod engine;

pub use engine::TemplateEngine;
