//! Shared fixtures for integration tests.
#![allow(dead_code)]

use chrono::{DateTime, NaiveDate, Utc};

use railops_backend::graph::SectionGraph;
use railops_backend::models::{BlockRecord, StationRecord, TrainClass, TrainEvent};

pub fn station(id: &str, platforms: u32, min_dwell_min: f64, route_setup_min: f64) -> StationRecord {
    StationRecord {
        station_id: id.to_string(),
        name: None,
        platforms,
        min_dwell_min,
        route_setup_min,
        lat: None,
        lon: None,
    }
}

pub fn block(id: &str, u: &str, v: &str, run: f64, headway: f64, capacity: u32) -> BlockRecord {
    BlockRecord {
        block_id: id.to_string(),
        u: u.to_string(),
        v: v.to_string(),
        min_run_time: run,
        headway,
        capacity,
        headway_peak_p90: None,
        headway_offpeak_p90: None,
    }
}

fn ts(raw: &str) -> Option<DateTime<Utc>> {
    Some(raw.parse().expect("fixture timestamp"))
}

#[allow(clippy::too_many_arguments)]
pub fn event(
    train: &str,
    station: &str,
    seq: u32,
    sched_arr: Option<&str>,
    sched_dep: Option<&str>,
    act_arr: Option<&str>,
    act_dep: Option<&str>,
) -> TrainEvent {
    TrainEvent {
        train_id: train.to_string(),
        station_id: station.to_string(),
        service_date: NaiveDate::from_ymd_opt(2024, 1, 1).expect("fixture date"),
        stop_seq: Some(seq),
        sched_arr: sched_arr.and_then(ts),
        sched_dep: sched_dep.and_then(ts),
        act_arr: act_arr.and_then(ts),
        act_dep: act_dep.and_then(ts),
        priority: 0,
        class: TrainClass::Passenger,
    }
}

/// S1: one block (headway 5, capacity 1); leader T1 runs 08:00-08:10, the
/// follower T2 asks for entry at 08:12.
pub fn s1_graph() -> SectionGraph {
    SectionGraph::load(
        vec![station("S1", 2, 2.0, 0.0), station("S2", 2, 2.0, 0.0)],
        vec![block("B1", "S1", "S2", 10.0, 5.0, 1)],
    )
    .expect("s1 graph")
}

pub fn s1_events() -> Vec<TrainEvent> {
    vec![
        event("T1", "S1", 1, None, None, None, Some("2024-01-01T08:00:00Z")),
        event("T1", "S2", 2, None, None, Some("2024-01-01T08:10:00Z"), None),
        event("T2", "S1", 1, None, Some("2024-01-01T08:12:00Z"), None, None),
        event("T2", "S2", 2, Some("2024-01-01T08:22:00Z"), None, None, None),
    ]
}

/// S2: single-platform station SP; X and Y arrive one minute apart.
pub fn s2_graph() -> SectionGraph {
    SectionGraph::load(
        vec![station("S0", 2, 2.0, 0.0), station("SP", 1, 2.0, 0.0)],
        vec![block("B1", "S0", "SP", 10.0, 0.0, 2)],
    )
    .expect("s2 graph")
}

pub fn s2_events() -> Vec<TrainEvent> {
    vec![
        event("X", "S0", 1, None, Some("2024-01-01T08:50:00Z"), None, None),
        event("X", "SP", 2, Some("2024-01-01T09:00:00Z"), None, None, None),
        event("Y", "S0", 1, None, Some("2024-01-01T08:51:00Z"), None, None),
        event("Y", "SP", 2, Some("2024-01-01T09:01:00Z"), None, None, None),
    ]
}

/// A three-station corridor where a +5 disruption on T1 creates a headway
/// conflict with T2 that did not exist in the baseline.
pub fn disruption_graph() -> SectionGraph {
    SectionGraph::load(
        vec![station("S1", 2, 2.0, 0.0), station("S2", 2, 2.0, 0.0)],
        vec![block("B1", "S1", "S2", 10.0, 5.0, 1)],
    )
    .expect("disruption graph")
}

pub fn disruption_events() -> Vec<TrainEvent> {
    vec![
        event("T1", "S1", 1, None, Some("2024-01-01T08:00:00Z"), None, None),
        event("T1", "S2", 2, Some("2024-01-01T08:10:00Z"), None, None, None),
        event("T2", "S1", 1, None, Some("2024-01-01T08:18:00Z"), None, None),
        event("T2", "S2", 2, Some("2024-01-01T08:28:00Z"), None, None, None),
    ]
}
