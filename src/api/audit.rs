use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::ledger::{DecisionRequest, TransitionContext};
use crate::models::{Action, Decision};
use crate::policy_store::PolicyStore;

use super::{require_roles, AppState, Principal};

#[derive(Debug, Deserialize)]
pub struct FeedbackBody {
    pub action: Action,
    pub decision: Decision,
    pub reason: Option<String>,
    pub modified: Option<Value>,
}

/// POST /api/v1/feedback
/// Record a decision on a recommended action. APPLY/DISMISS/MODIFY demand
/// controller authority; ACK additionally admits crew.
pub async fn post_feedback(
    State(state): State<AppState>,
    principal: Principal,
    Json(body): Json<FeedbackBody>,
) -> Result<Json<Value>, StatusCode> {
    if body.decision.requires_controller() {
        require_roles(&principal, &["SC", "ADM"])?;
    } else {
        require_roles(&principal, &["CREW", "SC", "OM", "DH", "ADM"])?;
    }

    let (scope, date) = (
        state.engine.cfg.scope.clone(),
        state.engine.cfg.date.clone(),
    );
    let snapshot = state.engine.snapshot().await;
    let policies: &PolicyStore = state.engine.policy_store();
    let policy = policies.load(&scope, &date).unwrap_or_default();
    let context = TransitionContext {
        graph: state.engine.graph(),
        occupancy: &snapshot.block_occupancy,
        risks: &snapshot.risks,
        previews: &snapshot.previews,
        policy: &policy,
    };

    let request = DecisionRequest {
        scope,
        date,
        who: principal.user.clone(),
        role: principal.role.clone(),
        action: body.action,
        decision: body.decision,
        reason: body.reason,
        modified: body.modified,
    };
    match state.engine.ledger().append(request, Some(&context)) {
        Ok(entry) => {
            state.metrics.decisions_total.inc();
            Ok(Json(json!({
                "status": "ok",
                "action_id": entry.action_id,
                "plan_version": entry.plan_version,
            })))
        }
        Err(e) => {
            tracing::error!(error = %e, "feedback append failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/v1/audit/trail
pub async fn get_trail(State(state): State<AppState>) -> Json<Value> {
    let trail = state
        .engine
        .ledger()
        .trail(&state.engine.cfg.scope, &state.engine.cfg.date);
    Json(json!({ "audit_trail": trail }))
}

/// GET /api/v1/audit/completeness
pub async fn get_completeness(State(state): State<AppState>) -> Json<Value> {
    let completeness = state
        .engine
        .ledger()
        .completeness(&state.engine.cfg.scope, &state.engine.cfg.date);
    Json(json!(completeness))
}
