//! Flowline Worker
//!
//! Runs one dispatcher replica against the shared PostgreSQL store: claims
//! due flows in its partitions plus due cron jobs, advances them and
//! persists the results. Any number of replicas may run side by side.

pub mod config;
pub mod worker;

pub use config::WorkerConfig;
pub use worker::Worker;
