//! What-if scenarios over the baseline: template application, a single-run
//! pipeline (replay, radar, propose), and Pareto selection across a batch.

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::graph::SectionGraph;
use crate::models::{
    BlockRecord, LocksState, PlanMetrics, Policy, RadarKpis, SimKpis, StationRecord, TrainEvent,
};
use crate::optimizer::{self, OptimizeContext, OptimizeParams};
use crate::radar::{self, RadarParams};
use crate::twin::{minutes, replay, ReplayOverrides};

/// Supported scenario templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScenarioSpec {
    LateStart {
        train_id: String,
        station_id: String,
        delay_min: f64,
        #[serde(default)]
        name: Option<String>,
    },
    PlatformOutage {
        station_id: String,
        platforms: u32,
        #[serde(default)]
        name: Option<String>,
    },
    SpeedRestriction {
        u: String,
        v: String,
        factor: f64,
        #[serde(default)]
        name: Option<String>,
    },
    SingleLineWorking {
        #[serde(default)]
        name: Option<String>,
    },
}

impl ScenarioSpec {
    pub fn name(&self) -> String {
        let (custom, kind) = match self {
            ScenarioSpec::LateStart { name, .. } => (name, "late_start"),
            ScenarioSpec::PlatformOutage { name, .. } => (name, "platform_outage"),
            ScenarioSpec::SpeedRestriction { name, .. } => (name, "speed_restriction"),
            ScenarioSpec::SingleLineWorking { name } => (name, "single_line_working"),
        };
        custom.clone().unwrap_or_else(|| kind.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub sim_kpis: SimKpis,
    pub risk_kpis: RadarKpis,
    pub plan_metrics: PlanMetrics,
    pub rec_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub results: Vec<ScenarioResult>,
    pub pareto_indices: Vec<usize>,
}

/// Apply a template to copies of (events, nodes, edges).
pub fn apply_template(
    events: &[TrainEvent],
    nodes: &[StationRecord],
    edges: &[BlockRecord],
    spec: &ScenarioSpec,
) -> (Vec<TrainEvent>, Vec<StationRecord>, Vec<BlockRecord>) {
    let mut events = events.to_vec();
    let mut nodes = nodes.to_vec();
    let mut edges = edges.to_vec();
    match spec {
        ScenarioSpec::LateStart {
            train_id,
            station_id,
            delay_min,
            ..
        } => {
            for event in events
                .iter_mut()
                .filter(|e| &e.train_id == train_id && &e.station_id == station_id)
            {
                if let Some(dep) = event.sched_dep {
                    event.sched_dep = Some(dep + minutes(*delay_min));
                }
                if let Some(dep) = event.act_dep {
                    event.act_dep = Some(dep + minutes(*delay_min));
                }
            }
        }
        ScenarioSpec::PlatformOutage {
            station_id,
            platforms,
            ..
        } => {
            for node in nodes.iter_mut().filter(|n| &n.station_id == station_id) {
                node.platforms = (*platforms).max(1);
            }
        }
        ScenarioSpec::SpeedRestriction { u, v, factor, .. } => {
            let factor = factor.max(1.0);
            for edge in edges.iter_mut().filter(|e| &e.u == u && &e.v == v) {
                edge.min_run_time *= factor;
            }
        }
        ScenarioSpec::SingleLineWorking { .. } => {
            for edge in edges.iter_mut() {
                edge.capacity = 1;
            }
        }
    }
    (events, nodes, edges)
}

/// Run one scenario end to end: template, replay, radar, optimizer.
pub fn run_one(
    events: &[TrainEvent],
    nodes: &[StationRecord],
    edges: &[BlockRecord],
    spec: &ScenarioSpec,
    horizon_min: i64,
) -> CoreResult<ScenarioResult> {
    let (events, nodes, edges) = apply_template(events, nodes, edges, spec);
    let graph = SectionGraph::load(nodes, edges)?;
    let sim = replay(&events, &graph, &ReplayOverrides::default())?;
    let radar_out = radar::analyze(
        &graph,
        &sim,
        &RadarParams {
            horizon_min,
            ..Default::default()
        },
    );
    let policy = Policy::default();
    let locks = LocksState::default();
    let heat = std::collections::HashMap::new();
    let proposal = optimizer::propose(
        &OptimizeContext {
            graph: &graph,
            block_occupancy: &sim.block_occupancy,
            risks: &radar_out.risks,
            policy: &policy,
            locks: &locks,
            risk_heat: &heat,
        },
        &OptimizeParams {
            horizon_min,
            ..Default::default()
        },
    );
    Ok(ScenarioResult {
        name: spec.name(),
        sim_kpis: sim.sim_kpis,
        risk_kpis: radar_out.kpis,
        rec_count: proposal.plan.actions.len() as u32,
        plan_metrics: proposal.metrics,
    })
}

/// Indices of non-dominated results by (avg exit delay ASC, trains served
/// DESC).
pub fn pareto_front(results: &[ScenarioResult]) -> Vec<usize> {
    let points: Vec<(usize, f64, f64)> = results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            (
                i,
                r.sim_kpis.avg_exit_delay_min,
                -(r.sim_kpis.trains_served as f64),
            )
        })
        .collect();
    let mut front = Vec::new();
    for &(i, delay_i, served_i) in &points {
        let dominated = points.iter().any(|&(j, delay_j, served_j)| {
            j != i
                && delay_j <= delay_i
                && served_j <= served_i
                && (delay_j < delay_i || served_j < served_i)
        });
        if !dominated {
            front.push(i);
        }
    }
    front
}

pub fn run_batch(
    events: &[TrainEvent],
    nodes: &[StationRecord],
    edges: &[BlockRecord],
    specs: &[ScenarioSpec],
    horizon_min: i64,
) -> CoreResult<BatchResult> {
    let mut results = Vec::with_capacity(specs.len());
    for spec in specs {
        results.push(run_one(events, nodes, edges, spec, horizon_min)?);
    }
    let pareto_indices = pareto_front(&results);
    Ok(BatchResult {
        batch_id: uuid::Uuid::new_v4().to_string(),
        results,
        pareto_indices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, delay: f64, served: u32) -> ScenarioResult {
        ScenarioResult {
            name: name.to_string(),
            sim_kpis: SimKpis {
                trains_served: served,
                avg_exit_delay_min: delay,
                ..Default::default()
            },
            risk_kpis: RadarKpis::default(),
            plan_metrics: PlanMetrics::default(),
            rec_count: 0,
        }
    }

    #[test]
    fn test_pareto_front() {
        let results = vec![
            result("a", 3.0, 10), // dominated by c
            result("b", 5.0, 12),
            result("c", 2.0, 10),
            result("d", 2.0, 12), // dominates b and c
        ];
        let front = pareto_front(&results);
        assert_eq!(front, vec![3]);
    }

    #[test]
    fn test_single_line_working_caps_capacity() {
        let edges = vec![BlockRecord {
            block_id: "B1".to_string(),
            u: "S1".to_string(),
            v: "S2".to_string(),
            min_run_time: 10.0,
            headway: 5.0,
            capacity: 3,
            headway_peak_p90: None,
            headway_offpeak_p90: None,
        }];
        let (_, _, edges) = apply_template(&[], &[], &edges, &ScenarioSpec::SingleLineWorking { name: None });
        assert_eq!(edges[0].capacity, 1);
    }
}
