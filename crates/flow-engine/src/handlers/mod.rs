//! HTTP handlers for the flow control plane API.
//!
//! This module contains all route handlers organized by domain.

pub mod definitions;
pub mod flows;
pub mod health;
pub mod simulate;

pub use health::{api_health, health_check};

use axum::{
    routing::{get, post},
    Router,
};

use crate::services::FlowService;
use crate::simulation::Simulator;

/// Definition, flow and simulation routes.
///
/// Health routes need the database and are added by the binary.
pub fn api_router(flow_service: FlowService, simulator: Simulator) -> Router {
    let definition_routes = Router::new()
        .route("/api/definitions", post(definitions::register))
        .route("/api/definitions/{id}", get(definitions::get))
        .with_state(flow_service.clone());

    let flow_routes = Router::new()
        .route("/api/flows", post(flows::create).get(flows::list))
        .route("/api/flows/{id}", get(flows::get))
        .route("/api/flows/{id}/cancel", post(flows::cancel))
        .with_state(flow_service);

    let simulation_routes = Router::new()
        .route("/api/simulate", post(simulate::simulate))
        .with_state(simulator);

    Router::new()
        .merge(definition_routes)
        .merge(flow_routes)
        .merge(simulation_routes)
}
