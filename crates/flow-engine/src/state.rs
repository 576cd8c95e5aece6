//! Application state for the flow control plane server.

use crate::config::AppConfig;
use crate::db::DbPool;
use std::sync::Arc;

/// Shared state for the health routes.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: DbPool,

    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig) -> Self {
        Self {
            db,
            config: Arc::new(config),
            start_time: std::time::Instant::now(),
        }
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
