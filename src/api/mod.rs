//! Thin HTTP surface over the engine. The core trusts the caller's role
//! tag; token verification lives at the external boundary.

pub mod audit;
pub mod plan;
pub mod policy;
pub mod scenario;
pub mod state;

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::engine::RuntimeEngine;
use crate::metrics::AppMetrics;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<RuntimeEngine>,
    pub metrics: Arc<AppMetrics>,
}

/// Caller identity from `x-user` / `x-role` headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user: String,
    pub role: String,
}

const KNOWN_ROLES: [&str; 6] = ["SC", "CREW", "OM", "DH", "AN", "ADM"];

fn normalize_role(role: Option<&str>) -> String {
    let upper = role.unwrap_or("AN").trim().to_uppercase();
    if KNOWN_ROLES.contains(&upper.as_str()) {
        upper
    } else {
        "AN".to_string()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        };
        Ok(Principal {
            user: header("x-user").unwrap_or_else(|| "anonymous".to_string()),
            role: normalize_role(header("x-role").as_deref()),
        })
    }
}

pub fn require_roles(principal: &Principal, allowed: &[&str]) -> Result<(), StatusCode> {
    if allowed.contains(&principal.role.as_str()) {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

pub fn require_controller(principal: &Principal) -> Result<(), StatusCode> {
    require_roles(principal, &["SC", "ADM"])
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(state::health_check))
        // Twin and radar reads
        .route("/api/v1/state", get(state::get_state))
        .route("/api/v1/snapshot", get(state::get_snapshot))
        .route("/api/v1/radar", get(state::get_radar))
        .route("/api/v1/recommendations", get(state::get_recommendations))
        .route("/api/v1/crew/feed", get(state::crew_feed))
        // Plan operations
        .route("/api/v1/apply", post(plan::post_apply))
        .route("/api/v1/optimize", post(plan::post_optimize))
        .route("/api/v1/disruption", post(plan::post_disruption))
        .route("/api/v1/plan/revert", post(plan::post_revert))
        // Policy console and locks
        .route("/api/v1/policy", get(policy::get_policy).put(policy::put_policy))
        .route(
            "/api/v1/locks/resource",
            get(policy::get_locks).post(policy::post_resource_lock),
        )
        .route("/api/v1/locks/precedence", post(policy::post_precedence_pin))
        // Audit and feedback
        .route("/api/v1/feedback", post(audit::post_feedback))
        .route("/api/v1/audit/trail", get(audit::get_trail))
        .route("/api/v1/audit/completeness", get(audit::get_completeness))
        // Scenarios and coordination
        .route("/api/v1/scenario/run", post(scenario::post_scenario_run))
        .route("/api/v1/scenario/batch", post(scenario::post_scenario_batch))
        .route("/api/v1/coord/handshake", post(scenario::post_handshake))
        // Metrics
        .route("/metrics", get(crate::metrics::metrics_handler));

    if state.config.server.cors_enabled {
        router = router.layer(tower_http::cors::CorsLayer::permissive());
    }
    router.with_state(state)
}
