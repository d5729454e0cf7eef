use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::coord;
use crate::scenario::{self, ScenarioSpec};
use crate::store::{self, rows};

use super::{require_roles, AppState, Principal};

#[derive(Debug, Deserialize)]
pub struct ScenarioRunBody {
    pub spec: ScenarioSpec,
    #[serde(default = "default_horizon")]
    pub horizon_min: i64,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioBatchBody {
    pub specs: Vec<ScenarioSpec>,
    #[serde(default = "default_horizon")]
    pub horizon_min: i64,
}

fn default_horizon() -> i64 {
    60
}

/// POST /api/v1/scenario/run
pub async fn post_scenario_run(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<ScenarioRunBody>,
) -> Result<Json<Value>, StatusCode> {
    require_roles(&principal, &["SC", "OM", "DH", "AN", "ADM"])?;
    let events = state.engine.current_events().await;
    let graph = state.engine.graph();
    match scenario::run_one(&events, graph.nodes(), graph.edges(), &body.spec, body.horizon_min) {
        Ok(result) => Ok(Json(json!({"status": "ok", "result": result}))),
        Err(e) => Ok(Json(json!({"status": "error", "error": e.to_string()}))),
    }
}

/// POST /api/v1/scenario/batch
/// Run several what-ifs and return the Pareto front over (delay, served).
pub async fn post_scenario_batch(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<ScenarioBatchBody>,
) -> Result<Json<Value>, StatusCode> {
    require_roles(&principal, &["SC", "OM", "DH", "AN", "ADM"])?;
    let events = state.engine.current_events().await;
    let graph = state.engine.graph();
    match scenario::run_batch(&events, graph.nodes(), graph.edges(), &body.specs, body.horizon_min) {
        Ok(result) => Ok(Json(json!({"status": "ok", "batch": result}))),
        Err(e) => Ok(Json(json!({"status": "error", "error": e.to_string()}))),
    }
}

#[derive(Debug, Deserialize)]
pub struct HandshakeBody {
    pub scope_a: String,
    pub date_a: String,
    pub scope_b: String,
    pub date_b: String,
    pub boundary_station: String,
}

/// POST /api/v1/coord/handshake
/// Align arrivals from scope A with scope B's earliest boundary departure.
pub async fn post_handshake(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<HandshakeBody>,
) -> Result<Json<Value>, StatusCode> {
    require_roles(&principal, &["SC", "OM", "DH", "ADM"])?;
    let artifacts = state.engine.artifacts();
    let load = |scope: &str, date: &str| -> Result<Vec<crate::models::BlockOccupancy>, crate::error::CoreError> {
        let rows: Vec<rows::BlockOccupancyRow> =
            artifacts.read_parquet(scope, date, store::BLOCK_OCCUPANCY)?;
        rows.into_iter().map(|r| r.into_model()).collect()
    };
    let occupancy_a = match load(&body.scope_a, &body.date_a) {
        Ok(occupancy) => occupancy,
        Err(e) => return Ok(Json(json!({"status": "error", "error": e.to_string()}))),
    };
    let occupancy_b = match load(&body.scope_b, &body.date_b) {
        Ok(occupancy) => occupancy,
        Err(e) => return Ok(Json(json!({"status": "error", "error": e.to_string()}))),
    };
    let result = coord::coordinate(&occupancy_a, &occupancy_b, &body.boundary_station);
    Ok(Json(json!({"status": "ok", "handshake": result})))
}
