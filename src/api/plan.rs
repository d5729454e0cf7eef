use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{require_controller, AppState, Principal};

#[derive(Debug, Deserialize)]
pub struct ApplyRequest {
    pub action_id: String,
    pub modifiers: Option<Value>,
}

/// POST /api/v1/apply
/// Sandbox-gated; live dispatch is out of scope here.
pub async fn post_apply(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<ApplyRequest>,
) -> Result<Json<Value>, StatusCode> {
    require_controller(&principal)?;
    let result = state.engine.apply_action(&body.action_id, body.modifiers).await;
    Ok(Json(result))
}

/// POST /api/v1/optimize
/// Force a recompute now and return the (possibly hysteresis-stabilised)
/// plan.
pub async fn post_optimize(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Value>, StatusCode> {
    require_controller(&principal)?;
    state.metrics.engine_ticks_total.inc();
    if let Err(e) = state.engine.tick_once().await {
        state.metrics.engine_tick_failures_total.inc();
        tracing::error!(error = %e, "on-demand optimize failed");
        return Ok(Json(json!({
            "status": "error",
            "error": e.to_string(),
        })));
    }
    let snapshot = state.engine.snapshot().await;
    Ok(Json(json!({
        "status": "ok",
        "plan": &snapshot.plan,
        "plan_metrics": &snapshot.plan_metrics,
        "audit_log": &snapshot.optimizer_audit,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DisruptionRequest {
    pub train_id: String,
    pub station_id: String,
    pub delay_min: f64,
}

/// POST /api/v1/disruption
/// Inject a +delay at (train, station) and recompute; the prior plan is
/// retained as plan_prev for revert.
pub async fn post_disruption(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<DisruptionRequest>,
) -> Result<Json<Value>, StatusCode> {
    require_controller(&principal)?;
    match state
        .engine
        .inject_disruption(&body.train_id, &body.station_id, body.delay_min, chrono::Utc::now())
        .await
    {
        Ok(()) => {
            let snapshot = state.engine.snapshot().await;
            Ok(Json(json!({
                "status": "ok",
                "plan_version": &snapshot.plan.plan_version,
                "plan_prev_version": &snapshot.plan_prev.plan_version,
            })))
        }
        Err(e) => Ok(Json(json!({"status": "error", "error": e.to_string()}))),
    }
}

/// POST /api/v1/plan/revert
pub async fn post_revert(
    State(state): State<AppState>,
    principal: Principal,
) -> Result<Json<Value>, StatusCode> {
    require_controller(&principal)?;
    let plan = state.engine.revert_plan().await;
    Ok(Json(json!({
        "status": "ok",
        "plan_version": plan.plan_version,
        "actions": plan.actions.len(),
    })))
}
