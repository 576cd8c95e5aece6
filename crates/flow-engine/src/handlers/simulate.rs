//! Simulation API handler.

use axum::{extract::State, Json};

use crate::simulation::{SimulationRequest, SimulationResult, Simulator};

/// Run a definition against a sample event without side effects.
///
/// POST /api/simulate
///
/// Always answers `200 OK`; problems are reported through the result's
/// skip reason.
pub async fn simulate(
    State(simulator): State<Simulator>,
    Json(request): Json<SimulationRequest>,
) -> Json<SimulationResult> {
    Json(simulator.run(&request).await)
}
