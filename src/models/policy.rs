use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

const CLASS_NAMES: [&str; 6] = ["superfast", "express", "emu", "passenger", "freight", "mail"];

fn default_max_holds() -> u32 {
    2
}

fn default_max_hold_min() -> f64 {
    5.0
}

fn default_time_limit_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FairnessLimits {
    /// Hard cap on HOLD actions per train per plan.
    #[serde(default = "default_max_holds")]
    pub max_holds_per_train: u32,
    /// Upper bound on a single hold, minutes.
    #[serde(default = "default_max_hold_min")]
    pub max_hold_min: f64,
}

impl Default for FairnessLimits {
    fn default() -> Self {
        Self {
            max_holds_per_train: default_max_holds(),
            max_hold_min: default_max_hold_min(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSla {
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: u64,
}

impl Default for SolverSla {
    fn default() -> Self {
        Self {
            time_limit_ms: default_time_limit_ms(),
        }
    }
}

/// Versioned optimizer policy, read at the start of every optimizer call.
///
/// `priority_weights` is keyed strictly by train id; a weight keyed by train
/// class is rejected at parse time so the two readings can never mix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub priority_weights: BTreeMap<String, f64>,
    /// Per-train or per-class cumulative hold caps, minutes.
    #[serde(default)]
    pub hold_budgets: BTreeMap<String, f64>,
    #[serde(default)]
    pub fairness_limits: FairnessLimits,
    #[serde(rename = "solver_SLA", default)]
    pub solver_sla: SolverSla,
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
}

impl Policy {
    pub fn validate(&self) -> CoreResult<()> {
        for key in self.priority_weights.keys() {
            if CLASS_NAMES.contains(&key.to_lowercase().as_str()) {
                return Err(CoreError::Policy(format!(
                    "priority_weights must be keyed by train id, found class key '{key}'"
                )));
            }
        }
        if self.fairness_limits.max_hold_min < 2.0 {
            return Err(CoreError::Policy(
                "fairness_limits.max_hold_min must be at least 2 minutes".to_string(),
            ));
        }
        if self.fairness_limits.max_holds_per_train == 0 {
            return Err(CoreError::Policy(
                "fairness_limits.max_holds_per_train must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Priority weight for a train; unknown trains weigh zero.
    pub fn priority_of(&self, train_id: &str) -> f64 {
        self.priority_weights.get(train_id).copied().unwrap_or(0.0)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }
}

/// Update provenance for the policy store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provenance {
    #[serde(default)]
    pub policy_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_policy_update_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Platform,
    Block,
}

/// Controller-set hard constraint: the optimizer must not touch this
/// resource while locked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLock {
    #[serde(rename = "type")]
    pub kind: LockKind,
    pub id: String,
    pub locked: bool,
}

/// Forces the follower choice on a block regardless of arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecedencePin {
    pub block_id: String,
    pub leader: String,
    pub follower: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocksState {
    #[serde(default)]
    pub resource_locks: Vec<ResourceLock>,
    #[serde(default)]
    pub precedence_pins: Vec<PrecedencePin>,
}

impl LocksState {
    /// Stations whose platforms are locked against reassignment.
    pub fn locked_stations(&self) -> Vec<&str> {
        self.resource_locks
            .iter()
            .filter(|l| l.locked && l.kind == LockKind::Platform)
            .map(|l| l.id.as_str())
            .collect()
    }

    pub fn pin_for_block(&self, block_id: &str) -> Option<&PrecedencePin> {
        self.precedence_pins.iter().find(|p| p.block_id == block_id)
    }
}
