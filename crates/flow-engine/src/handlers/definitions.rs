//! Flow definition API handlers.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::model::FlowDefinition;
use crate::services::FlowService;

/// Response for definition registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: String,
    pub steps: usize,
    pub message: String,
}

/// Parse a definition body, YAML when the content type says so.
fn parse_definition(headers: &HeaderMap, body: &str) -> AppResult<FlowDefinition> {
    let is_yaml = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("yaml"))
        .unwrap_or(false);

    if is_yaml {
        Ok(FlowDefinition::from_yaml(body)?)
    } else {
        serde_json::from_str(body).map_err(|e| AppError::Parse(e.to_string()))
    }
}

/// Register a flow definition.
///
/// POST /api/definitions
pub async fn register(
    State(service): State<FlowService>,
    headers: HeaderMap,
    body: String,
) -> AppResult<(StatusCode, Json<RegisterResponse>)> {
    let definition = parse_definition(&headers, &body)?;
    service.register_definition(&definition).await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id: definition.id.clone(),
            steps: definition.steps.len(),
            message: format!("Flow definition '{}' registered", definition.id),
        }),
    ))
}

/// Get a flow definition.
///
/// GET /api/definitions/{id}
pub async fn get(
    State(service): State<FlowService>,
    Path(id): Path<String>,
) -> AppResult<Json<FlowDefinition>> {
    Ok(Json(service.get_definition(&id).await?))
}
