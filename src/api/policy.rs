use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{json, Value};

use crate::models::{LocksState, Policy, PrecedencePin, ResourceLock};

use super::{require_roles, AppState, Principal};

/// GET /api/v1/policy
pub async fn get_policy(State(state): State<AppState>) -> Json<Value> {
    let (scope, date) = (&state.engine.cfg.scope, &state.engine.cfg.date);
    let policies = state.engine.policy_store();
    let policy = policies.load(scope, date).unwrap_or_default();
    Json(json!({
        "policy_state": policy,
        "provenance": policies.provenance(scope, date),
    }))
}

/// PUT /api/v1/policy
/// Operations roles only; takes effect on the next tick.
pub async fn put_policy(
    State(state): State<AppState>,
    principal: Principal,
    Json(policy): Json<Policy>,
) -> Result<Json<Value>, StatusCode> {
    require_roles(&principal, &["OM", "DH", "ADM"])?;
    let (scope, date) = (&state.engine.cfg.scope, &state.engine.cfg.date);
    match state
        .engine
        .policy_store()
        .save(scope, date, &policy, &principal.user)
    {
        Ok(provenance) => Ok(Json(json!({"status": "ok", "provenance": provenance}))),
        Err(e) => Ok(Json(json!({"status": "rejected", "error": e.to_string()}))),
    }
}

/// GET /api/v1/locks/resource
pub async fn get_locks(State(state): State<AppState>) -> Json<LocksState> {
    let (scope, date) = (&state.engine.cfg.scope, &state.engine.cfg.date);
    Json(state.engine.policy_store().load_locks(scope, date))
}

/// POST /api/v1/locks/resource
/// Upsert one resource lock; `locked: false` releases it.
pub async fn post_resource_lock(
    State(state): State<AppState>,
    principal: Principal,
    Json(lock): Json<ResourceLock>,
) -> Result<Json<Value>, StatusCode> {
    require_roles(&principal, &["SC", "OM", "ADM"])?;
    let (scope, date) = (&state.engine.cfg.scope, &state.engine.cfg.date);
    let policies = state.engine.policy_store();
    let mut locks = policies.load_locks(scope, date);
    locks
        .resource_locks
        .retain(|l| !(l.kind == lock.kind && l.id == lock.id));
    locks.resource_locks.push(lock);
    match policies.save_locks(scope, date, &locks) {
        Ok(()) => Ok(Json(json!({"status": "ok", "locks": locks}))),
        Err(e) => Ok(Json(json!({"status": "error", "error": e.to_string()}))),
    }
}

/// POST /api/v1/locks/precedence
/// Pin leader/follower order on a block.
pub async fn post_precedence_pin(
    State(state): State<AppState>,
    principal: Principal,
    Json(pin): Json<PrecedencePin>,
) -> Result<Json<Value>, StatusCode> {
    require_roles(&principal, &["SC", "OM", "ADM"])?;
    let (scope, date) = (&state.engine.cfg.scope, &state.engine.cfg.date);
    let policies = state.engine.policy_store();
    let mut locks = policies.load_locks(scope, date);
    locks.precedence_pins.retain(|p| p.block_id != pin.block_id);
    locks.precedence_pins.push(pin);
    match policies.save_locks(scope, date, &locks) {
        Ok(()) => Ok(Json(json!({"status": "ok", "locks": locks}))),
        Err(e) => Ok(Json(json!({"status": "error", "error": e.to_string()}))),
    }
}
