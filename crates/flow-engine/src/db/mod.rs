//! PostgreSQL connectivity and schema.

pub mod pool;
pub mod schema;

pub use pool::{create_pool, health_check, DbPool};
pub use schema::ensure_schema;
