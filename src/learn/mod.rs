//! State/label contracts for the learning loop.
//!
//! The core does not train models; it emits the state features the
//! optimizer ranks by, shaped rewards for accepted holds, and an imitation
//! table mirroring each radar risk with its hold-class label.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::graph::SectionGraph;
use crate::models::{
    Action, ActionKind, BlockOccupancy, MitigationPreview, Policy, Risk, RlState,
};

/// Reward shaping coefficients:
/// `resolved - alpha*minutes - beta*priority_weight*minutes - gamma*recent_holds`.
#[derive(Debug, Clone, Copy)]
pub struct RewardParams {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for RewardParams {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            beta: 0.1,
            gamma: 0.05,
        }
    }
}

/// Discrete hold class used as the imitation label.
pub fn hold_class(minutes: f64) -> i64 {
    if minutes <= 2.5 {
        2
    } else if minutes <= 4.0 {
        3
    } else {
        5
    }
}

/// Whether a hold of `minutes` resolves the risk, using the mitigation
/// preview when available.
pub fn hold_resolves(risk: &Risk, preview: Option<&MitigationPreview>, minutes: f64) -> bool {
    if let Some(preview) = preview {
        let need = if preview.required_hold_min > 0.0 {
            preview.required_hold_min
        } else {
            risk.required_hold_min
        };
        if need > 0.0 && minutes >= need {
            return true;
        }
        if minutes <= 2.5 && preview.hold_2min_resolves {
            return true;
        }
        if minutes >= 4.0 && preview.hold_5min_resolves {
            return true;
        }
        return false;
    }
    risk.required_hold_min > 0.0 && minutes >= risk.required_hold_min
}

pub fn reward(
    resolved: bool,
    minutes: f64,
    priority_weight: f64,
    recent_holds: i64,
    params: RewardParams,
) -> f64 {
    let base = if resolved { 1.0 } else { 0.0 };
    base - params.alpha * minutes
        - params.beta * priority_weight * minutes
        - params.gamma * recent_holds as f64
}

/// Features describing the situation the decision was taken in.
pub fn state_features(
    risk: &Risk,
    graph: &SectionGraph,
    occupancy: &[BlockOccupancy],
) -> RlState {
    let (headway_min, capacity, block_len_trains) = match risk.block_id.as_deref() {
        Some(block_id) => {
            let mut trains: Vec<&str> = occupancy
                .iter()
                .filter(|o| o.block_id == block_id)
                .map(|o| o.train_id.as_str())
                .collect();
            trains.sort();
            trains.dedup();
            (
                graph.block_headway(block_id),
                graph.block_capacity(block_id) as i64,
                trains.len() as i64,
            )
        }
        None => (0.0, 1, 0),
    };
    let platforms = risk
        .station_id
        .as_deref()
        .map(|sid| graph.station_platforms(sid) as i64)
        .unwrap_or(1);
    RlState {
        severity_rank: risk.severity.rank() as i64,
        lead_min: risk.lead_min,
        headway_min,
        capacity,
        block_len_trains,
        platforms,
    }
}

/// One imitation-learning example (`il_training.parquet`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IlExample {
    pub risk_type: String,
    pub block_id: Option<String>,
    pub station_id: Option<String>,
    pub train_id: String,
    pub severity_rank: i64,
    pub lead_min: f64,
    pub headway_min: f64,
    pub capacity: i64,
    pub block_len_trains: i64,
    pub platforms: i64,
    pub priority_weight: f64,
    pub recent_holds: i64,
    pub required_hold_min: f64,
    /// Expert label: hold class of the plan's action on this risk, or the
    /// class implied by the required hold.
    pub hold_class: i64,
}

/// Build imitation examples for a run: one row per risk, labelled by the
/// plan's hold when the plan targets the same train and resource.
pub fn build_il_examples(
    risks: &[Risk],
    plan: &[Action],
    graph: &SectionGraph,
    occupancy: &[BlockOccupancy],
    policy: &Policy,
) -> Vec<IlExample> {
    let mut expert: HashMap<(&str, &str), f64> = HashMap::new();
    for action in plan {
        if action.kind != ActionKind::Hold {
            continue;
        }
        let location = action
            .block_id
            .as_deref()
            .or(action.station_id.as_deref())
            .or(action.at_station.as_deref());
        if let (Some(location), Some(minutes)) = (location, action.minutes) {
            expert.insert((action.train_id.as_str(), location), minutes);
        }
    }

    let mut holds_so_far: HashMap<&str, i64> = HashMap::new();
    let mut examples = Vec::with_capacity(risks.len());
    for risk in risks {
        let Some(train_id) = risk.primary_train() else {
            continue;
        };
        let state = state_features(risk, graph, occupancy);
        let location = risk.resource_ref();
        let minutes = expert
            .get(&(train_id, location))
            .copied()
            .unwrap_or_else(|| risk.required_hold_min.max(2.0));
        let recent = holds_so_far.entry(train_id).or_insert(0);
        examples.push(IlExample {
            risk_type: risk.risk_type.as_str().to_string(),
            block_id: risk.block_id.clone(),
            station_id: risk.station_id.clone(),
            train_id: train_id.to_string(),
            severity_rank: state.severity_rank,
            lead_min: state.lead_min,
            headway_min: state.headway_min,
            capacity: state.capacity,
            block_len_trains: state.block_len_trains,
            platforms: state.platforms,
            priority_weight: policy.priority_of(train_id),
            recent_holds: *recent,
            required_hold_min: risk.required_hold_min,
            hold_class: hold_class(minutes),
        });
        *recent += 1;
    }
    examples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RiskType, Severity};

    fn risk(required: f64) -> Risk {
        Risk {
            risk_type: RiskType::Headway,
            severity: Severity::High,
            lead_min: 10.0,
            window_start: "2024-01-01T08:00:00Z".parse().unwrap(),
            window_end: "2024-01-01T08:05:00Z".parse().unwrap(),
            block_id: Some("B1".to_string()),
            station_id: None,
            u: Some("S1".to_string()),
            v: Some("S2".to_string()),
            train_ids: vec!["T1".to_string(), "T2".to_string()],
            required_hold_min: required,
        }
    }

    #[test]
    fn test_hold_class_boundaries() {
        assert_eq!(hold_class(2.0), 2);
        assert_eq!(hold_class(2.5), 2);
        assert_eq!(hold_class(3.0), 3);
        assert_eq!(hold_class(4.5), 5);
    }

    #[test]
    fn test_resolution_prefers_preview() {
        let r = risk(3.0);
        assert!(hold_resolves(&r, None, 3.0));
        assert!(!hold_resolves(&r, None, 2.0));

        let preview = MitigationPreview {
            risk_index: 0,
            risk_type: RiskType::Headway,
            block_id: Some("B1".to_string()),
            station_id: None,
            train_ids: r.train_ids.clone(),
            hold_2min_resolves: true,
            hold_5min_resolves: true,
            required_hold_min: 0.0,
            eta_delta_min_2: 2.0,
            eta_delta_min_5: 5.0,
        };
        assert!(hold_resolves(&risk(0.0), Some(&preview), 2.0));
    }

    #[test]
    fn test_reward_shaping() {
        let params = RewardParams::default();
        let resolved = reward(true, 3.0, 2.0, 1, params);
        // 1 - 0.2*3 - 0.1*2*3 - 0.05*1
        assert!((resolved - (1.0 - 0.6 - 0.6 - 0.05)).abs() < 1e-9);
        let unresolved = reward(false, 3.0, 0.0, 0, params);
        assert!(unresolved < 0.0);
    }
}
