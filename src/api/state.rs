use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::{Action, ActionKind};

use super::{AppState, Principal};

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "railops-backend",
        "scope": &state.engine.cfg.scope,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct StateQuery {
    pub train_id: Option<String>,
    pub station_id: Option<String>,
}

/// GET /api/v1/state
/// Twin view: platform occupancy, waiting ledger, and replay KPIs, scoped
/// to the caller's train or station when requested.
pub async fn get_state(
    State(state): State<AppState>,
    principal: Principal,
    Query(query): Query<StateQuery>,
) -> Json<Value> {
    let snapshot = state.engine.snapshot().await;
    let mut platforms = snapshot.platform_occupancy.clone();
    let mut waits = snapshot.waiting_ledger.clone();
    if principal.role == "CREW" {
        if let Some(train_id) = &query.train_id {
            platforms.retain(|p| &p.train_id == train_id);
            waits.retain(|w| &w.train_id == train_id);
        }
    }
    if principal.role == "SC" {
        if let Some(station_id) = &query.station_id {
            platforms.retain(|p| &p.station_id == station_id);
            waits.retain(|w| {
                w.resource == crate::models::WaitResource::Platform && &w.id == station_id
            });
        }
    }

    Json(json!({
        "platform_occupancy": platforms,
        "waiting_ledger": waits,
        "sim_kpis": &snapshot.sim_kpis,
        "last_error": state.engine.last_error().await,
        "whoami": principal,
    }))
}

/// GET /api/v1/snapshot
pub async fn get_snapshot(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.engine.snapshot().await;
    Json(json!({
        "tick": snapshot.tick,
        "computed_at": snapshot.computed_at,
        "positions": &snapshot.positions,
        "plan_version": &snapshot.plan.plan_version,
    }))
}

/// GET /api/v1/radar
pub async fn get_radar(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.engine.snapshot().await;
    Json(json!({
        "risks": &snapshot.risks,
        "previews": &snapshot.previews,
        "kpis": &snapshot.radar_kpis,
        "validation": &snapshot.validation,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RecommendationQuery {
    pub station_id: Option<String>,
}

/// GET /api/v1/recommendations
pub async fn get_recommendations(
    State(state): State<AppState>,
    Query(query): Query<RecommendationQuery>,
) -> Json<Value> {
    let snapshot = state.engine.snapshot().await;
    let mut actions = snapshot.plan.actions.clone();
    if let Some(station_id) = &query.station_id {
        actions.retain(|a| {
            a.at_station.as_deref() == Some(station_id)
                || a.station_id.as_deref() == Some(station_id)
        });
    }
    Json(json!({
        "recommendations": actions,
        "alt_options": &snapshot.alt_options,
        "plan_metrics": &snapshot.plan_metrics,
        "audit_log": &snapshot.optimizer_audit,
        "plan_version": &snapshot.plan.plan_version,
        "plan_prev_version": &snapshot.plan_prev.plan_version,
    }))
}

#[derive(Debug, Serialize)]
pub struct CrewInstruction {
    pub action_id: String,
    pub train_id: String,
    pub summary: String,
}

#[derive(Debug, Deserialize)]
pub struct CrewQuery {
    pub train_id: Option<String>,
}

fn crew_summary(action: &Action) -> String {
    match action.kind {
        ActionKind::Hold | ActionKind::Overtake => format!(
            "Hold at {} for {} min",
            action.at_station.as_deref().unwrap_or("?"),
            action.minutes.unwrap_or(0.0)
        ),
        ActionKind::PlatformReassign => format!(
            "Use platform {} at {}",
            action
                .platform
                .as_ref()
                .and_then(|p| p.slot())
                .map(|s| s.to_string())
                .unwrap_or_else(|| "any".to_string()),
            action.station_id.as_deref().unwrap_or("?")
        ),
        ActionKind::SpeedTune => format!(
            "Block {}: speed x{}",
            action.block_id.as_deref().unwrap_or("?"),
            action.speed_factor.unwrap_or(1.0)
        ),
    }
}

/// GET /api/v1/crew/feed
/// Per-train simplified instruction list.
pub async fn crew_feed(
    State(state): State<AppState>,
    Query(query): Query<CrewQuery>,
) -> Result<Json<Value>, StatusCode> {
    let snapshot = state.engine.snapshot().await;
    let instructions: Vec<CrewInstruction> = snapshot
        .plan
        .actions
        .iter()
        .filter(|a| match &query.train_id {
            Some(train_id) => &a.train_id == train_id,
            None => true,
        })
        .map(|a| CrewInstruction {
            action_id: a.action_id.clone().unwrap_or_else(|| a.compute_id()),
            train_id: a.train_id.clone(),
            summary: crew_summary(a),
        })
        .collect();
    Ok(Json(json!({ "instructions": instructions })))
}
