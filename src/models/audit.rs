use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::plan::Action;

/// Controller decision on a recommended action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "APPLY")]
    Apply,
    #[serde(rename = "DISMISS")]
    Dismiss,
    #[serde(rename = "MODIFY")]
    Modify,
    #[serde(rename = "ACK")]
    Ack,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Apply => "APPLY",
            Decision::Dismiss => "DISMISS",
            Decision::Modify => "MODIFY",
            Decision::Ack => "ACK",
        }
    }

    /// APPLY, DISMISS and MODIFY require controller authority; ACK is for
    /// crew acknowledgement.
    pub fn requires_controller(&self) -> bool {
        !matches!(self, Decision::Ack)
    }
}

/// Immutable, append-only record of one decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub who: String,
    pub role: String,
    pub action_id: String,
    pub decision: Decision,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub plan_version: String,
    pub action: Action,
}

/// Flat analytics mirror of an audit entry (`feedback.parquet`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub ts: String,
    pub user: String,
    pub role: String,
    pub decision: String,
    pub reason: Option<String>,
    pub plan_version: String,
    pub action_id: String,
    pub modified: Option<String>,
    /// Full action as JSON text.
    pub action: String,
}

/// Offline-RL state features, drawn from the same features the optimizer
/// ranks risks by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlState {
    pub severity_rank: i64,
    pub lead_min: f64,
    pub headway_min: f64,
    pub capacity: i64,
    pub block_len_trains: i64,
    pub platforms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub hold_class: i64,
    pub minutes: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlInfo {
    pub scope: String,
    pub date: String,
    pub risk_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,
    pub train_id: String,
    pub resolved: bool,
    pub priority_weight: f64,
    pub recent_holds: i64,
}

/// One line of the global offline-RL JSONL corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlTransition {
    pub state: RlState,
    pub action: RlAction,
    pub reward: f64,
    pub info: RlInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditCompleteness {
    pub recommendations: u32,
    pub decisions_logged: u32,
    pub completeness_pct: f64,
}
