use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use super::risk::Risk;

/// Micro-action kinds the optimizer may propose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "HOLD")]
    Hold,
    #[serde(rename = "PLATFORM_REASSIGN")]
    PlatformReassign,
    #[serde(rename = "SPEED_TUNE")]
    SpeedTune,
    #[serde(rename = "OVERTAKE")]
    Overtake,
}

/// Platform choice on a reassignment: a concrete slot index, or the
/// advisory "any" which apply-and-validate treats as non-operative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlatformChoice {
    Slot(u32),
    Named(String),
}

impl PlatformChoice {
    pub fn any() -> Self {
        PlatformChoice::Named("any".to_string())
    }

    pub fn slot(&self) -> Option<u32> {
        match self {
            PlatformChoice::Slot(idx) => Some(*idx),
            PlatformChoice::Named(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionImpact {
    pub conflicts_resolved: u32,
}

/// One proposed controller action with its explainability payload.
///
/// Optional fields are omitted from JSON entirely, so the canonical form
/// (and therefore `action_id`) only covers fields that are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    pub train_id: String,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_station: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding_constraints: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<ActionImpact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_checks: Option<Vec<String>>,
}

impl Action {
    /// Minimal HOLD constructor; explainability fields are filled by the
    /// optimizer.
    pub fn hold(train_id: impl Into<String>, at_station: impl Into<String>, minutes: f64) -> Self {
        Self {
            action_id: None,
            train_id: train_id.into(),
            kind: ActionKind::Hold,
            at_station: Some(at_station.into()),
            minutes: Some(minutes),
            block_id: None,
            station_id: None,
            platform: None,
            speed_factor: None,
            reason: None,
            why: None,
            binding_constraints: None,
            impact: None,
            safety_checks: None,
        }
    }

    /// Canonical JSON of this action with `action_id` excluded.
    pub fn canonical_json(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let serde_json::Value::Object(ref mut map) = value {
            map.remove("action_id");
        }
        canonical_json(&value)
    }

    /// Deterministic identity: SHA-1 hex of the canonical JSON.
    pub fn compute_id(&self) -> String {
        sha1_hex(self.canonical_json().as_bytes())
    }

    /// Return self with `action_id` populated.
    pub fn with_id(mut self) -> Self {
        let id = self.compute_id();
        self.action_id = Some(id);
        self
    }
}

/// Ordered action list with a stable version over its canonical JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub actions: Vec<Action>,
    pub plan_version: String,
}

impl Plan {
    pub fn new(actions: Vec<Action>) -> Self {
        let actions: Vec<Action> = actions.into_iter().map(Action::with_id).collect();
        let plan_version = Self::version_of(&actions);
        Self { actions, plan_version }
    }

    /// SHA-1 hex of the canonical JSON array of actions (action ids excluded,
    /// like the per-action hash).
    pub fn version_of(actions: &[Action]) -> String {
        let parts: Vec<String> = actions.iter().map(Action::canonical_json).collect();
        let joined = format!("[{}]", parts.join(","));
        sha1_hex(joined.as_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Render a JSON value with recursively sorted keys and tight separators,
/// matching `json.dumps(obj, sort_keys=True, separators=(",", ":"))`.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// A scored alternative attached to a risk alongside the primary action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AltChoice {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub train_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_station: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_factor: Option<f64>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AltOption {
    pub risk_ref: Risk,
    pub options: Vec<AltChoice>,
    pub tradeoffs: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanMetrics {
    pub actions: f64,
    pub conflicts_targeted: f64,
    pub expected_conflict_reduction: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ga_score: Option<f64>,
}

/// Metadata about an optimizer run, persisted as `audit_log.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerAudit {
    pub strategy: String,
    pub runtime_sec: f64,
    pub max_hold_min: f64,
    pub max_holds_per_train: u32,
    pub horizon_min: i64,
    pub t0: String,
    #[serde(default)]
    pub sla_exceeded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hold() -> Action {
        let mut a = Action::hold("T2", "S1", 3.0);
        a.reason = Some("headway".to_string());
        a.block_id = Some("B1".to_string());
        a
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value = serde_json::json!({"b": 1, "a": {"d": 2, "c": [3, 4]}});
        assert_eq!(canonical_json(&value), r#"{"a":{"c":[3,4],"d":2},"b":1}"#);
    }

    #[test]
    fn test_action_id_deterministic_and_excludes_id() {
        let a = sample_hold();
        let id1 = a.compute_id();
        let id2 = a.clone().with_id().compute_id();
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 40);
        assert!(id1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_plan_version_stable_and_order_sensitive() {
        let a = sample_hold();
        let b = Action::hold("T3", "S2", 2.0);
        let p1 = Plan::new(vec![a.clone(), b.clone()]);
        let p2 = Plan::new(vec![a.clone(), b.clone()]);
        let p3 = Plan::new(vec![b, a]);
        assert_eq!(p1.plan_version, p2.plan_version);
        assert_ne!(p1.plan_version, p3.plan_version);
    }

    #[test]
    fn test_platform_choice_serialization() {
        let slot = serde_json::to_string(&PlatformChoice::Slot(2)).unwrap();
        let any = serde_json::to_string(&PlatformChoice::any()).unwrap();
        assert_eq!(slot, "2");
        assert_eq!(any, "\"any\"");
    }
}
