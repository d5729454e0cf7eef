//! Priority- and fairness-aware action proposer over the risk radar.
//!
//! The heuristic resolves ranked risks with micro-holds (plus reassignment,
//! overtake and speed-tune alternatives) under policy caps, locks and pins,
//! re-verifying every hold against the live occupancy. A seeded genetic
//! search backs it up when the heuristic comes up empty or is explicitly
//! requested.

pub mod ga;

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::graph::SectionGraph;
use crate::models::{
    Action, ActionImpact, ActionKind, AltChoice, AltOption, BlockOccupancy, LocksState,
    OptimizerAudit, Plan, PlanMetrics, PlatformChoice, Policy, Risk, RiskType,
};
use crate::twin::{minutes, minutes_between};

#[derive(Debug, Clone, Copy)]
pub struct OptimizeParams {
    pub t0: Option<DateTime<Utc>>,
    pub horizon_min: i64,
    pub use_ga: bool,
    /// Chance-constraint level for risk-aware slack.
    pub epsilon: f64,
}

impl Default for OptimizeParams {
    fn default() -> Self {
        Self {
            t0: None,
            horizon_min: 60,
            use_ga: false,
            epsilon: 0.2,
        }
    }
}

pub struct OptimizeContext<'a> {
    pub graph: &'a SectionGraph,
    pub block_occupancy: &'a [BlockOccupancy],
    pub risks: &'a [Risk],
    pub policy: &'a Policy,
    pub locks: &'a LocksState,
    /// block_id -> incident probability, optional heat map.
    pub risk_heat: &'a HashMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct ProposeResult {
    pub plan: Plan,
    pub alt_options: Vec<AltOption>,
    pub metrics: PlanMetrics,
    pub audit: OptimizerAudit,
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

pub fn propose(ctx: &OptimizeContext<'_>, params: &OptimizeParams) -> ProposeResult {
    let started = Instant::now();
    let max_hold_min = ctx.policy.fairness_limits.max_hold_min;
    let max_holds_per_train = ctx.policy.fairness_limits.max_holds_per_train;
    let time_budget = std::time::Duration::from_millis(ctx.policy.solver_sla.time_limit_ms);

    let mut audit = OptimizerAudit {
        strategy: "heuristic".to_string(),
        runtime_sec: 0.0,
        max_hold_min,
        max_holds_per_train,
        horizon_min: params.horizon_min,
        t0: String::new(),
        sla_exceeded: false,
    };

    if ctx.block_occupancy.is_empty() {
        audit.runtime_sec = started.elapsed().as_secs_f64();
        return ProposeResult {
            plan: Plan::default(),
            alt_options: Vec::new(),
            metrics: PlanMetrics::default(),
            audit,
        };
    }

    let t0 = params.t0.unwrap_or_else(|| {
        ctx.block_occupancy
            .iter()
            .map(|b| b.entry_time)
            .min()
            .unwrap_or_else(Utc::now)
    });
    let t1 = t0 + minutes(params.horizon_min as f64);
    audit.t0 = t0.to_rfc3339();

    // Rank risks: most severe first, then soonest, then highest priority
    // train involved.
    let mut ranked: Vec<&Risk> = ctx
        .risks
        .iter()
        .filter(|r| r.window_start >= t0 && r.window_start <= t1)
        .collect();
    ranked.sort_by(|a, b| {
        let pa = max_priority(ctx.policy, &a.train_ids);
        let pb = max_priority(ctx.policy, &b.train_ids);
        a.severity
            .rank()
            .cmp(&b.severity.rank())
            .then_with(|| a.lead_min.total_cmp(&b.lead_min))
            .then_with(|| pb.total_cmp(&pa))
    });

    let mut by_block: BTreeMap<&str, Vec<&BlockOccupancy>> = BTreeMap::new();
    let mut by_train: BTreeMap<&str, Vec<&BlockOccupancy>> = BTreeMap::new();
    for occ in ctx.block_occupancy {
        by_block.entry(&occ.block_id).or_default().push(occ);
        by_train.entry(&occ.train_id).or_default().push(occ);
    }
    for group in by_block.values_mut() {
        group.sort_by_key(|o| o.entry_time);
    }
    for group in by_train.values_mut() {
        group.sort_by_key(|o| o.entry_time);
    }

    let assigned_slot = preassign_platforms(ctx, t0, t1);
    let locked_stations: Vec<&str> = ctx.locks.locked_stations();

    let mut actions: Vec<Action> = Vec::new();
    let mut alt_options: Vec<AltOption> = Vec::new();
    let mut holds_count: HashMap<String, u32> = HashMap::new();
    let mut targeted = 0u32;

    for risk in ranked {
        if started.elapsed() > time_budget {
            audit.sla_exceeded = true;
            debug!("optimizer SLA exhausted, returning best-so-far plan");
            break;
        }
        match risk.risk_type {
            RiskType::Headway | RiskType::BlockCapacity => handle_block_risk(
                ctx,
                risk,
                &by_block,
                max_hold_min,
                max_holds_per_train,
                params.epsilon,
                &mut holds_count,
                &mut actions,
                &mut alt_options,
                &mut targeted,
            ),
            RiskType::PlatformOverflow => handle_platform_risk(
                ctx,
                risk,
                &by_train,
                &assigned_slot,
                &locked_stations,
                max_hold_min,
                max_holds_per_train,
                &mut holds_count,
                &mut actions,
                &mut alt_options,
                &mut targeted,
            ),
        }
    }

    let mut metrics = PlanMetrics {
        actions: actions.len() as f64,
        conflicts_targeted: targeted as f64,
        expected_conflict_reduction: targeted as f64,
        ga_score: None,
    };

    // GA fallback when the heuristic yields nothing, or on request.
    if (params.use_ga || actions.is_empty()) && !ctx.block_occupancy.is_empty() {
        let (ga_actions, ga_metrics) =
            ga::propose_ga(ctx.graph, ctx.block_occupancy, ctx.risks, max_hold_min, None);
        if params.use_ga || !ga_actions.is_empty() {
            info!(actions = ga_actions.len(), score = ga_metrics.score, "using GA plan");
            actions = ga_actions;
            metrics.actions = actions.len() as f64;
            metrics.ga_score = Some(ga_metrics.score);
            audit.strategy = "ga".to_string();
        }
    }

    audit.runtime_sec = started.elapsed().as_secs_f64();
    ProposeResult {
        plan: Plan::new(actions),
        alt_options,
        metrics,
        audit,
    }
}

fn max_priority(policy: &Policy, trains: &[String]) -> f64 {
    trains
        .iter()
        .map(|t| policy.priority_of(t))
        .fold(0.0, f64::max)
}

/// Greedy earliest-free platform pre-assignment across the horizon, used to
/// give reassignment advisories a concrete slot.
fn preassign_platforms(
    ctx: &OptimizeContext<'_>,
    t0: DateTime<Utc>,
    t1: DateTime<Utc>,
) -> HashMap<(String, String), u32> {
    let mut arrivals: Vec<(&BlockOccupancy, DateTime<Utc>)> = ctx
        .block_occupancy
        .iter()
        .filter(|o| o.exit_time >= t0 && o.exit_time <= t1)
        .map(|o| (o, o.exit_time))
        .collect();
    arrivals.sort_by_key(|(o, at)| (*at, o.train_id.clone()));

    let mut slot_avail: HashMap<&str, Vec<DateTime<Utc>>> = HashMap::new();
    let mut assigned: HashMap<(String, String), u32> = HashMap::new();
    for (occ, at) in arrivals {
        let station = ctx.graph.station(&occ.v);
        let slots = slot_avail
            .entry(occ.v.as_str())
            .or_insert_with(|| vec![DateTime::<Utc>::MIN_UTC; station.platforms.max(1) as usize]);
        let idx = slots
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| **t)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let start = at.max(slots[idx]);
        slots[idx] = start + minutes(station.min_dwell_min);
        assigned.insert((occ.train_id.clone(), occ.v.clone()), idx as u32);
    }
    assigned
}

/// Pick the train to hold: the pinned follower when a precedence pin
/// matches, else the later-arriving train (last in the risk's ordered
/// list). Priority never changes the primary pick; it surfaces as an
/// OVERTAKE alternative instead.
fn choose_follower(locks: &LocksState, risk: &Risk) -> Option<String> {
    let trains = &risk.train_ids;
    if trains.is_empty() {
        return None;
    }
    if trains.len() > 1 {
        if let Some(block_id) = &risk.block_id {
            if let Some(pin) = locks.pin_for_block(block_id) {
                if trains.contains(&pin.leader) && trains.contains(&pin.follower) {
                    return Some(pin.follower.clone());
                }
            }
        }
    }
    trains.last().cloned()
}

#[allow(clippy::too_many_arguments)]
fn handle_block_risk(
    ctx: &OptimizeContext<'_>,
    risk: &Risk,
    by_block: &BTreeMap<&str, Vec<&BlockOccupancy>>,
    max_hold_min: f64,
    max_holds_per_train: u32,
    epsilon: f64,
    holds_count: &mut HashMap<String, u32>,
    actions: &mut Vec<Action>,
    alt_options: &mut Vec<AltOption>,
    targeted: &mut u32,
) {
    let Some(mut follower) = choose_follower(ctx.locks, risk) else {
        return;
    };

    // Fairness cap: swap to the least-held other train, or escalate
    // without a hold.
    if holds_count.get(&follower).copied().unwrap_or(0) >= max_holds_per_train {
        let alternative = risk
            .train_ids
            .iter()
            .filter(|t| **t != follower)
            .filter(|t| holds_count.get(*t).copied().unwrap_or(0) < max_holds_per_train)
            .min_by(|a, b| {
                holds_count
                    .get(*a)
                    .copied()
                    .unwrap_or(0)
                    .cmp(&holds_count.get(*b).copied().unwrap_or(0))
                    .then_with(|| {
                        ctx.policy
                            .priority_of(a.as_str())
                            .total_cmp(&ctx.policy.priority_of(b.as_str()))
                    })
                    .then_with(|| a.cmp(b))
            });
        match alternative {
            Some(other) => follower = other.clone(),
            None => {
                alt_options.push(AltOption {
                    risk_ref: risk.clone(),
                    options: vec![AltChoice {
                        kind: ActionKind::Hold,
                        train_id: follower.clone(),
                        at_station: risk.u.clone(),
                        minutes: Some(2.0),
                        block_id: risk.block_id.clone(),
                        speed_factor: None,
                        score: -0.5,
                    }],
                    tradeoffs: "Fairness cap reached for all involved trains; escalated for manual decision.".to_string(),
                });
                return;
            }
        }
    }

    let need = if risk.risk_type == RiskType::Headway {
        risk.required_hold_min
    } else {
        2.0
    };
    let mut hold_min = need.max(2.0).min(max_hold_min);

    // Risk-aware slack from the incident heat map (chance constraint
    // P(conflict) < epsilon).
    if let Some(block_id) = &risk.block_id {
        if let Some(&prob) = ctx.risk_heat.get(block_id) {
            let th_hi = (1.0 - epsilon.clamp(0.01, 0.5)).max(0.5);
            let th_lo = (th_hi - 0.2).max(0.3);
            if prob >= th_hi {
                hold_min = (hold_min + 2.0).min(max_hold_min);
            } else if prob >= th_lo {
                hold_min = (hold_min + 1.0).min(max_hold_min);
            }
        }
    }

    // Verify against the live plan; raise the hold up to the cap if the
    // headway gap is still open.
    let mut binding = vec![match risk.risk_type {
        RiskType::Headway => "headway".to_string(),
        _ => "block_capacity".to_string(),
    }];
    if let Some(block_id) = &risk.block_id {
        if let Some(group) = by_block.get(block_id.as_str()) {
            let headway = ctx.graph.block_headway(block_id);
            if let Some(row) = group
                .iter()
                .find(|o| o.train_id == follower && o.entry_time >= risk.window_start)
            {
                let prev_exit = group
                    .iter()
                    .filter(|o| o.entry_time < row.entry_time)
                    .map(|o| o.exit_time)
                    .max();
                if let Some(prev_exit) = prev_exit {
                    let entry_new = row.entry_time + minutes(hold_min);
                    let required = prev_exit + minutes(headway);
                    if entry_new < required {
                        let gap = minutes_between(required, row.entry_time);
                        hold_min = gap.max(2.0).min(max_hold_min);
                        if hold_min < gap {
                            binding.push("headway_unresolvable_within_cap".to_string());
                        }
                    }
                }
            }
        }
    }

    let others: Vec<&str> = risk
        .train_ids
        .iter()
        .filter(|t| **t != follower)
        .map(|s| s.as_str())
        .collect();
    let block_ref = risk.block_id.clone().unwrap_or_default();
    let mut action = Action::hold(follower.clone(), risk.u.clone().unwrap_or_default(), round1(hold_min));
    action.reason = Some(risk.risk_type.as_str().to_string());
    action.block_id = risk.block_id.clone();
    action.why = Some(format!(
        "Resolve {} on {} vs {}",
        risk.risk_type.as_str(),
        block_ref,
        others.join(", ")
    ));
    action.binding_constraints = Some(binding);
    action.impact = Some(ActionImpact { conflicts_resolved: 1 });
    action.safety_checks = Some(vec!["hold_within_policy_limit".to_string()]);
    let action_minutes = action.minutes.unwrap_or(hold_min);
    actions.push(action);
    *holds_count.entry(follower.clone()).or_insert(0) += 1;
    *targeted += 1;

    // Short vs safe alternatives.
    alt_options.push(AltOption {
        risk_ref: risk.clone(),
        options: vec![
            AltChoice {
                kind: ActionKind::Hold,
                train_id: follower.clone(),
                at_station: risk.u.clone(),
                minutes: Some(2.0),
                block_id: None,
                speed_factor: None,
                score: 0.0,
            },
            AltChoice {
                kind: ActionKind::Hold,
                train_id: follower.clone(),
                at_station: risk.u.clone(),
                minutes: Some(5.0f64.min(max_hold_min)),
                block_id: None,
                speed_factor: None,
                score: -0.1,
            },
        ],
        tradeoffs: "Short hold vs safer longer hold; impact estimated via ETA deltas.".to_string(),
    });

    // When the follower outranks the leader, offer an overtake instead.
    if risk.train_ids.len() >= 2 {
        if let Some(leader) = risk.train_ids.iter().find(|t| **t != follower) {
            if ctx.policy.priority_of(&follower) > ctx.policy.priority_of(leader) {
                alt_options.push(AltOption {
                    risk_ref: risk.clone(),
                    options: vec![AltChoice {
                        kind: ActionKind::Overtake,
                        train_id: leader.clone(),
                        at_station: risk.u.clone(),
                        minutes: Some(action_minutes),
                        block_id: risk.block_id.clone(),
                        speed_factor: None,
                        score: -0.05,
                    }],
                    tradeoffs: "Hold leader to allow higher-priority follower to pass at station.".to_string(),
                });
            }
        }
    }

    alt_options.push(AltOption {
        risk_ref: risk.clone(),
        options: vec![AltChoice {
            kind: ActionKind::SpeedTune,
            train_id: follower,
            at_station: None,
            minutes: None,
            block_id: risk.block_id.clone(),
            speed_factor: Some(0.95),
            score: -0.02,
        }],
        tradeoffs: "Within policy, reduce run-time by 5% on this block.".to_string(),
    });
}

#[allow(clippy::too_many_arguments)]
fn handle_platform_risk(
    ctx: &OptimizeContext<'_>,
    risk: &Risk,
    by_train: &BTreeMap<&str, Vec<&BlockOccupancy>>,
    assigned_slot: &HashMap<(String, String), u32>,
    locked_stations: &[&str],
    max_hold_min: f64,
    max_holds_per_train: u32,
    holds_count: &mut HashMap<String, u32>,
    actions: &mut Vec<Action>,
    alt_options: &mut Vec<AltOption>,
    targeted: &mut u32,
) {
    let Some(station_id) = risk.station_id.clone() else {
        return;
    };
    let Some(pick) = choose_follower(ctx.locks, risk) else {
        return;
    };
    if holds_count.get(&pick).copied().unwrap_or(0) >= max_holds_per_train {
        alt_options.push(AltOption {
            risk_ref: risk.clone(),
            options: vec![AltChoice {
                kind: ActionKind::Hold,
                train_id: pick,
                at_station: Some(station_id),
                minutes: Some(2.0),
                block_id: None,
                speed_factor: None,
                score: -0.5,
            }],
            tradeoffs: "Fairness cap reached; escalated for manual decision.".to_string(),
        });
        return;
    }

    // Prefer holding upstream of the congested station, at the u of the
    // inbound block closest to the risk time.
    let upstream = by_train.get(pick.as_str()).and_then(|group| {
        group
            .iter()
            .filter(|o| o.v == station_id)
            .min_by_key(|o| (o.exit_time - risk.window_start).num_seconds().abs())
            .map(|o| o.u.clone())
    });
    let at_station = upstream.clone().unwrap_or_else(|| station_id.clone());
    let reason = if at_station != station_id {
        "platform_overflow_upstream"
    } else {
        "platform_overflow"
    };

    let hold_min = risk.required_hold_min.max(2.0).min(max_hold_min);
    let mut action = Action::hold(pick.clone(), at_station.clone(), round1(hold_min));
    action.reason = Some(reason.to_string());
    action.station_id = Some(station_id.clone());
    action.why = Some(format!("Smooth arrival into {station_id} by holding at {at_station}"));
    action.impact = Some(ActionImpact { conflicts_resolved: 1 });
    action.safety_checks = Some(vec!["hold_within_policy_limit".to_string()]);
    actions.push(action);
    *holds_count.entry(pick.clone()).or_insert(0) += 1;
    *targeted += 1;

    if !locked_stations.contains(&station_id.as_str()) {
        let platform = assigned_slot
            .get(&(pick.clone(), station_id.clone()))
            .map(|idx| PlatformChoice::Slot(*idx))
            .unwrap_or_else(PlatformChoice::any);
        let mut reassign = Action {
            action_id: None,
            train_id: pick.clone(),
            kind: ActionKind::PlatformReassign,
            at_station: None,
            minutes: None,
            block_id: None,
            station_id: Some(station_id.clone()),
            platform: Some(platform),
            speed_factor: None,
            reason: Some("spread_load".to_string()),
            why: Some(format!("Use alternate platform at {station_id} if available")),
            binding_constraints: Some(vec!["platform_capacity".to_string()]),
            impact: None,
            safety_checks: Some(vec!["platform_exists_or_any".to_string()]),
        };
        reassign.impact = Some(ActionImpact { conflicts_resolved: 0 });
        actions.push(reassign);
    }

    alt_options.push(AltOption {
        risk_ref: risk.clone(),
        options: vec![
            AltChoice {
                kind: ActionKind::Hold,
                train_id: pick.clone(),
                at_station: Some(station_id.clone()),
                minutes: Some(2.0),
                block_id: None,
                speed_factor: None,
                score: 0.0,
            },
            AltChoice {
                kind: ActionKind::Hold,
                train_id: pick,
                at_station: Some(station_id),
                minutes: Some(5.0f64.min(max_hold_min)),
                block_id: None,
                speed_factor: None,
                score: -0.1,
            },
        ],
        tradeoffs: "Hold to avoid platform overflow; reassignment possible if multiple platforms.".to_string(),
    });
}
