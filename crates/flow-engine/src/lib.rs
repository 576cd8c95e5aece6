//! Flowline Engine
//!
//! Durable execution of automation flows: multi-step reactions to domain
//! events that survive restarts and run across many worker replicas.
//!
//! - **Model**: flow definitions (step graphs) and the persisted execution state
//! - **Interpreter**: advances one flow by one step, with branching, retries and timeouts
//! - **Dispatcher**: claims due flows and cron jobs per partition and drives the interpreter
//! - **Store**: conditional single-row updates over PostgreSQL (or memory, for tests)
//! - **Simulation**: side-effect free walk of a definition against a sample event
//! - **Control plane**: HTTP API for definitions, flows, cancellation and simulation
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use flow_engine::{
//!     dispatcher::{CronHandlers, Dispatcher, DispatcherConfig},
//!     engine::{Interpreter, SystemClock},
//!     store::MemoryStore,
//! };
//!
//! let store = Arc::new(MemoryStore::new());
//! let interpreter = Interpreter::new(flow_steps::steps::create_default_registry());
//! let dispatcher = Dispatcher::new(
//!     store.clone(),
//!     store,
//!     interpreter,
//!     CronHandlers::new(),
//!     DispatcherConfig::default(),
//!     Arc::new(SystemClock),
//! );
//! let handle = dispatcher.start();
//! // ...
//! handle.stop().await;
//! ```

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod model;
pub mod result_ext;
pub mod services;
pub mod simulation;
pub mod state;
pub mod store;

pub use error::{AppError, AppResult};
pub use result_ext::ResultExt;
