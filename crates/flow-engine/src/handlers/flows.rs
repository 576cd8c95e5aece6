//! Flow instance API handlers.
//!
//! Handles creation, listing, inspection and cancellation of flows.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppResult;
use crate::model::FlowStatus;
use crate::services::{FlowExecutionStateDto, FlowService, FlowSummary};

const DEFAULT_LIST_LIMIT: usize = 50;

/// Request for creating a flow instance.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateFlowRequest {
    pub definition_id: String,
    pub owner_id: String,

    /// Initial context, usually the triggering event.
    #[serde(default)]
    pub context: serde_json::Value,

    /// First claim time. Defaults to now.
    #[serde(default)]
    pub due_time: Option<DateTime<Utc>>,
}

/// Response for flow creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFlowResponse {
    pub id: Uuid,
}

/// Query parameters for listing flows.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListFlowsQuery {
    pub owner_id: Option<String>,
    pub limit: Option<usize>,
}

/// Response for cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub id: Uuid,
    pub status: FlowStatus,
}

/// Create a flow instance.
///
/// POST /api/flows
pub async fn create(
    State(service): State<FlowService>,
    Json(request): Json<CreateFlowRequest>,
) -> AppResult<(StatusCode, Json<CreateFlowResponse>)> {
    let id = service
        .create_instance(
            &request.definition_id,
            &request.owner_id,
            request.context,
            request.due_time,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(CreateFlowResponse { id })))
}

/// List flows, most recent first.
///
/// GET /api/flows
pub async fn list(
    State(service): State<FlowService>,
    Query(query): Query<ListFlowsQuery>,
) -> AppResult<Json<Vec<FlowSummary>>> {
    let flows = service
        .list(
            query.owner_id.as_deref(),
            query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        )
        .await?;
    Ok(Json(flows))
}

/// Get the execution state of a flow.
///
/// GET /api/flows/{id}
pub async fn get(
    State(service): State<FlowService>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<FlowExecutionStateDto>> {
    Ok(Json(service.get(id).await?))
}

/// Cancel a flow.
///
/// POST /api/flows/{id}/cancel
pub async fn cancel(
    State(service): State<FlowService>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<CancelResponse>> {
    let status = service.cancel(id).await?;
    Ok(Json(CancelResponse { id, status }))
}
