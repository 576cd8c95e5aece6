//! Health check endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::db::health_check as db_health_check;
use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    /// Health status ("ok" or "unhealthy")
    pub status: String,
}

/// Detailed health check response for the API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiHealthResponse {
    pub status: String,

    /// Database connectivity status
    pub database: String,

    pub server_name: String,

    pub uptime_seconds: u64,

    pub version: String,
}

/// Basic health check endpoint.
///
/// `GET /health`
///
/// Suitable for load balancer checks; never touches the database.
pub async fn health_check() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "ok".to_string(),
    })
}

/// Detailed API health check endpoint.
///
/// `GET /api/health`
///
/// # Returns
///
/// - `200 OK` when the database answers
/// - `503 Service Unavailable` otherwise
pub async fn api_health(State(state): State<AppState>) -> (StatusCode, Json<ApiHealthResponse>) {
    let db_healthy = db_health_check(&state.db).await;

    let (status, status_code) = if db_healthy {
        ("ok", StatusCode::OK)
    } else {
        ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
    };

    let response = ApiHealthResponse {
        status: status.to_string(),
        database: if db_healthy { "connected" } else { "disconnected" }.to_string(),
        server_name: state.config.server_name.clone(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response))
}
