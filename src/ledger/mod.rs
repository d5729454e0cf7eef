//! Append-only decision ledger with an analytics mirror and the
//! offline-RL feedback hook.
//!
//! Entries are never mutated once written; the per-process advisory lock
//! serialises writers so the trail file is rewritten whole, in order.

use std::sync::Mutex;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::CoreResult;
use crate::graph::SectionGraph;
use crate::learn::{self, RewardParams};
use crate::models::{
    Action, ActionKind, AuditCompleteness, AuditEntry, BlockOccupancy, Decision, FeedbackRecord,
    MitigationPreview, Plan, Policy, Risk, RlAction, RlInfo, RlTransition,
};
use crate::store::{self, ArtifactStore};

/// A decision submitted by the external boundary. The core trusts the
/// caller's role tag; token verification happens outside.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub scope: String,
    pub date: String,
    pub who: String,
    pub role: String,
    pub action: Action,
    pub decision: Decision,
    pub reason: Option<String>,
    pub modified: Option<serde_json::Value>,
}

/// Twin context needed to derive the RL transition for accepted holds.
pub struct TransitionContext<'a> {
    pub graph: &'a SectionGraph,
    pub occupancy: &'a [BlockOccupancy],
    pub risks: &'a [Risk],
    pub previews: &'a [MitigationPreview],
    pub policy: &'a Policy,
}

pub struct Ledger {
    store: ArtifactStore,
    write_lock: Mutex<()>,
    reward_params: RewardParams,
}

impl Ledger {
    pub fn new(store: ArtifactStore) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            reward_params: RewardParams::default(),
        }
    }

    /// Append a decision to the immutable trail, mirror it to the analytics
    /// table, and emit an RL transition for accepted holds.
    pub fn append(
        &self,
        request: DecisionRequest,
        context: Option<&TransitionContext<'_>>,
    ) -> CoreResult<AuditEntry> {
        let action = request.action.clone().with_id();
        let action_id = action.action_id.clone().unwrap_or_default();

        let plan_actions: Vec<Action> =
            self.store
                .read_json_or(&request.scope, &request.date, store::REC_PLAN);
        let plan_version = Plan::version_of(&plan_actions);

        let entry = AuditEntry {
            ts: Utc::now(),
            who: request.who.clone(),
            role: request.role.clone(),
            action_id: action_id.clone(),
            decision: request.decision,
            details: request.modified.clone().unwrap_or(serde_json::Value::Null),
            reason: request.reason.clone(),
            plan_version,
            action: action.clone(),
        };

        let recent_holds;
        {
            let _guard = self.write_lock.lock().map_err(|_| {
                crate::error::CoreError::Persistence {
                    path: self.store.artifact_path(&request.scope, &request.date, store::AUDIT_TRAIL),
                    message: "audit writer lock poisoned".to_string(),
                }
            })?;

            let mut trail: Vec<AuditEntry> =
                self.store
                    .read_json_or(&request.scope, &request.date, store::AUDIT_TRAIL);
            recent_holds = trail
                .iter()
                .filter(|e| {
                    e.action.train_id == action.train_id && e.action.kind == ActionKind::Hold
                })
                .count() as i64;
            trail.push(entry.clone());
            self.store
                .write_json(&request.scope, &request.date, store::AUDIT_TRAIL, &trail)?;

            let mut feedback: Vec<FeedbackRecord> = match self.store.read_parquet(
                &request.scope,
                &request.date,
                store::FEEDBACK,
            ) {
                Ok(rows) => rows,
                Err(crate::error::CoreError::MissingArtifact(_)) => Vec::new(),
                Err(e) => {
                    warn!(error = %e, "feedback mirror unreadable, restarting it");
                    Vec::new()
                }
            };
            feedback.push(FeedbackRecord {
                ts: entry.ts.to_rfc3339(),
                user: entry.who.clone(),
                role: entry.role.clone(),
                decision: entry.decision.as_str().to_string(),
                reason: entry.reason.clone(),
                plan_version: entry.plan_version.clone(),
                action_id: action_id.clone(),
                modified: request.modified.as_ref().map(|m| m.to_string()),
                action: serde_json::to_string(&action)?,
            });
            self.store
                .write_parquet(&request.scope, &request.date, store::FEEDBACK, &feedback)?;
        }

        // Accepted holds feed the learning loop.
        let accepted = matches!(
            request.decision,
            Decision::Apply | Decision::Modify | Decision::Ack
        );
        if accepted && action.kind == ActionKind::Hold {
            if let Some(context) = context {
                if let Err(e) = self.emit_transition(&request, &action, recent_holds, context) {
                    warn!(error = %e, "offline-RL transition not written");
                }
            }
        }

        info!(
            scope = %request.scope,
            date = %request.date,
            decision = entry.decision.as_str(),
            action_id = %action_id,
            "decision recorded"
        );
        Ok(entry)
    }

    fn emit_transition(
        &self,
        request: &DecisionRequest,
        action: &Action,
        recent_holds: i64,
        context: &TransitionContext<'_>,
    ) -> CoreResult<()> {
        let minutes = action.minutes.unwrap_or(0.0);
        let matched = match_risk(context.risks, action);
        let (risk, preview) = match matched {
            Some((index, risk)) => (
                risk,
                context.previews.iter().find(|p| p.risk_index == index),
            ),
            None => return Ok(()),
        };
        let priority_weight = context.policy.priority_of(&action.train_id);
        let resolved = learn::hold_resolves(risk, preview, minutes);
        let reward = learn::reward(
            resolved,
            minutes,
            priority_weight,
            recent_holds,
            self.reward_params,
        );
        let transition = RlTransition {
            state: learn::state_features(risk, context.graph, context.occupancy),
            action: RlAction {
                kind: "HOLD".to_string(),
                hold_class: learn::hold_class(minutes),
                minutes,
            },
            reward,
            info: RlInfo {
                scope: request.scope.clone(),
                date: request.date.clone(),
                risk_type: risk.risk_type.as_str().to_string(),
                block_id: risk.block_id.clone(),
                station_id: risk.station_id.clone(),
                train_id: action.train_id.clone(),
                resolved,
                priority_weight,
                recent_holds,
            },
        };
        self.store.append_global_jsonl(store::OFFLINE_RL, &transition)
    }

    pub fn trail(&self, scope: &str, date: &str) -> Vec<AuditEntry> {
        self.store.read_json_or(scope, date, store::AUDIT_TRAIL)
    }

    /// decisions_logged / recommendations over the current plan.
    pub fn completeness(&self, scope: &str, date: &str) -> AuditCompleteness {
        let plan: Vec<Action> = self.store.read_json_or(scope, date, store::REC_PLAN);
        let trail = self.trail(scope, date);
        let recommendations = plan.len() as u32;
        let decisions_logged = trail.len() as u32;
        let completeness_pct = if recommendations > 0 {
            decisions_logged as f64 / recommendations as f64 * 100.0
        } else {
            0.0
        };
        AuditCompleteness {
            recommendations,
            decisions_logged,
            completeness_pct,
        }
    }
}

/// Find the risk this action targets: same train plus the same block,
/// station, or upstream station.
fn match_risk<'a>(risks: &'a [Risk], action: &Action) -> Option<(usize, &'a Risk)> {
    risks.iter().enumerate().find(|(_, risk)| {
        if !risk.train_ids.iter().any(|t| t == &action.train_id) {
            return false;
        }
        let block_match = action
            .block_id
            .as_deref()
            .is_some_and(|b| risk.block_id.as_deref() == Some(b));
        let station_match = action
            .station_id
            .as_deref()
            .is_some_and(|s| risk.station_id.as_deref() == Some(s));
        let upstream_match = action
            .at_station
            .as_deref()
            .is_some_and(|s| risk.u.as_deref() == Some(s) || risk.station_id.as_deref() == Some(s));
        block_match || station_match || upstream_match
    })
}
