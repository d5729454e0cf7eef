//! What-if application of a plan: shift departures, re-replay, re-run the
//! radar, and report before/after deltas with safety verification.
//!
//! Pure over its inputs; the source event set is never mutated.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::graph::SectionGraph;
use crate::models::{
    Action, ActionKind, PlatformOccupancy, Risk, RiskValidation, SimResult, TrainEvent,
};
use crate::radar::{self, RadarParams};
use crate::twin::{minutes, minutes_between, replay, ReplayOverrides};

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct HorizonKpis {
    pub otp_exit_pct: f64,
    pub avg_exit_delay_min: f64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ApplyReport {
    pub baseline_risks: u32,
    pub applied_risks: u32,
    pub risk_reduction: i64,
    pub risk_reduction_headway_block: i64,
    pub risk_breakdown_before: BTreeMap<String, u32>,
    pub risk_breakdown_after: BTreeMap<String, u32>,
    pub validation_after: RiskValidation,
    pub wait_minutes_before: f64,
    pub wait_minutes_after: f64,
    pub kpi_before: HorizonKpis,
    pub kpi_after: HorizonKpis,
}

/// Clone the events with HOLD/OVERTAKE minutes applied to the matching
/// departure: shift `act_dep` when present, else create it from `sched_dep`.
pub fn apply_holds_to_events(events: &[TrainEvent], plan: &[Action]) -> Vec<TrainEvent> {
    let mut out = events.to_vec();
    for action in plan {
        if !matches!(action.kind, ActionKind::Hold | ActionKind::Overtake) {
            continue;
        }
        let Some(at_station) = action.at_station.as_deref() else {
            continue;
        };
        let hold = action.minutes.unwrap_or(0.0);
        if hold <= 0.0 {
            continue;
        }
        for event in out
            .iter_mut()
            .filter(|e| e.train_id == action.train_id && e.station_id == at_station)
        {
            let base = event.act_dep.or(event.sched_dep);
            if let Some(base) = base {
                event.act_dep = Some(base + minutes(hold));
            }
        }
    }
    out
}

/// Collect SPEED_TUNE and operative PLATFORM_REASSIGN directives as replay
/// overrides. A reassignment to "any" is advisory and stays non-operative.
pub fn overrides_from_plan(plan: &[Action]) -> ReplayOverrides {
    let mut overrides = ReplayOverrides::default();
    for action in plan {
        match action.kind {
            ActionKind::SpeedTune => {
                if let (Some(block_id), Some(factor)) = (&action.block_id, action.speed_factor) {
                    overrides
                        .per_train_speed
                        .insert((action.train_id.clone(), block_id.clone()), factor);
                }
            }
            ActionKind::PlatformReassign => {
                if let Some(station_id) = &action.station_id {
                    if let Some(slot) = action.platform.as_ref().and_then(|p| p.slot()) {
                        overrides
                            .platform_override
                            .insert((action.train_id.clone(), station_id.clone()), slot);
                    }
                }
            }
            _ => {}
        }
    }
    overrides
}

pub fn apply_and_validate(
    events: &[TrainEvent],
    graph: &SectionGraph,
    plan: &[Action],
    t0: Option<DateTime<Utc>>,
    horizon_min: i64,
) -> CoreResult<ApplyReport> {
    let sim_before = replay(events, graph, &ReplayOverrides::default())?;

    let adjusted = apply_holds_to_events(events, plan);
    let overrides = overrides_from_plan(plan);
    let sim_after = replay(&adjusted, graph, &overrides)?;

    let params = RadarParams {
        t0,
        horizon_min,
        ..Default::default()
    };
    let radar_before = radar::analyze(graph, &sim_before, &params);
    let radar_after = radar::analyze(graph, &sim_after, &params);
    let validation_after = radar::validate(&sim_after.block_occupancy, graph, &radar_after.risks);

    let effective_t0 = t0.or(radar_before.t0).or(radar_after.t0);
    let breakdown_before = breakdown(&radar_before.risks);
    let breakdown_after = breakdown(&radar_after.risks);
    let hb_before = block_risk_count(&breakdown_before);
    let hb_after = block_risk_count(&breakdown_after);

    Ok(ApplyReport {
        baseline_risks: radar_before.risks.len() as u32,
        applied_risks: radar_after.risks.len() as u32,
        risk_reduction: radar_before.risks.len() as i64 - radar_after.risks.len() as i64,
        risk_reduction_headway_block: hb_before as i64 - hb_after as i64,
        risk_breakdown_before: breakdown_before,
        risk_breakdown_after: breakdown_after,
        validation_after,
        wait_minutes_before: wait_in_horizon(&sim_before, effective_t0, horizon_min),
        wait_minutes_after: wait_in_horizon(&sim_after, effective_t0, horizon_min),
        kpi_before: horizon_kpis(events, &sim_before.platform_occupancy, effective_t0, horizon_min),
        kpi_after: horizon_kpis(events, &sim_after.platform_occupancy, effective_t0, horizon_min),
    })
}

fn breakdown(risks: &[Risk]) -> BTreeMap<String, u32> {
    let mut out = BTreeMap::new();
    for risk in risks {
        *out.entry(risk.risk_type.as_str().to_string()).or_insert(0) += 1;
    }
    out
}

fn block_risk_count(breakdown: &BTreeMap<String, u32>) -> u32 {
    breakdown.get("headway").copied().unwrap_or(0)
        + breakdown.get("block_capacity").copied().unwrap_or(0)
}

fn wait_in_horizon(sim: &SimResult, t0: Option<DateTime<Utc>>, horizon_min: i64) -> f64 {
    sim.waiting_ledger
        .iter()
        .filter(|w| match t0 {
            Some(t0) => w.start_time >= t0 && w.start_time <= t0 + minutes(horizon_min as f64),
            None => true,
        })
        .map(|w| w.minutes)
        .sum()
}

/// OTP and average delay over trains whose final departure falls in the
/// horizon; delay is measured against the scheduled arrival at that stop.
fn horizon_kpis(
    events: &[TrainEvent],
    platform_occupancy: &[PlatformOccupancy],
    t0: Option<DateTime<Utc>>,
    horizon_min: i64,
) -> HorizonKpis {
    let mut last_dep: HashMap<&str, &PlatformOccupancy> = HashMap::new();
    for window in platform_occupancy {
        last_dep
            .entry(&window.train_id)
            .and_modify(|w| {
                if window.dep_platform > w.dep_platform {
                    *w = window;
                }
            })
            .or_insert(window);
    }
    let mut sched_arr: HashMap<(&str, &str), DateTime<Utc>> = HashMap::new();
    for event in events {
        if let Some(arr) = event.sched_arr {
            sched_arr
                .entry((event.train_id.as_str(), event.station_id.as_str()))
                .or_insert(arr);
        }
    }

    let mut delays = Vec::new();
    for (train_id, window) in last_dep {
        if let Some(t0) = t0 {
            let t1 = t0 + minutes(horizon_min as f64);
            if window.dep_platform < t0 || window.dep_platform > t1 {
                continue;
            }
        }
        if let Some(sched) = sched_arr.get(&(train_id, window.station_id.as_str())) {
            delays.push(minutes_between(window.dep_platform, *sched));
        }
    }
    if delays.is_empty() {
        return HorizonKpis::default();
    }
    let on_time = delays.iter().filter(|d| d.abs() <= 5.0).count();
    HorizonKpis {
        otp_exit_pct: on_time as f64 / delays.len() as f64 * 100.0,
        avg_exit_delay_min: delays.iter().sum::<f64>() / delays.len() as f64,
    }
}
