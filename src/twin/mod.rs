//! Event-driven replay of the section under block and platform safety.
//!
//! From normalised events the replay produces a conflict-free schedule that
//! honours actual observations when present, enforces block capacity and
//! headway plus platform capacity and minimum dwell, and emits a waiting
//! ledger explaining every deviation.

pub mod snapshot;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::graph::SectionGraph;
use crate::models::{
    BlockOccupancy, OccupancySource, PlatformOccupancy, SimKpis, SimResult, TrainEvent, WaitEntry,
    WaitReason, WaitResource,
};

/// Per-call modifiers accepted by the replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayOverrides {
    /// (train_id, block_id) -> run-time factor in [0.8, 1.0].
    pub per_train_speed: HashMap<(String, String), f64>,
    /// (train_id, station_id) -> pinned platform slot index.
    pub platform_override: HashMap<(String, String), u32>,
}

pub fn minutes_between(later: DateTime<Utc>, earlier: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 60_000.0
}

pub fn minutes(m: f64) -> Duration {
    Duration::milliseconds((m * 60_000.0).round() as i64)
}

struct StopTimes {
    sched_arr: Option<DateTime<Utc>>,
    sched_dep: Option<DateTime<Utc>>,
    act_arr: Option<DateTime<Utc>>,
    act_dep: Option<DateTime<Utc>>,
}

/// Per-station platform allocator: one next-free instant per slot.
struct PlatformSlots {
    free_at: Vec<DateTime<Utc>>,
}

impl PlatformSlots {
    fn new(platforms: u32) -> Self {
        Self {
            free_at: vec![DateTime::<Utc>::MIN_UTC; platforms.max(1) as usize],
        }
    }

    /// Pick the requested slot (when valid) or the earliest-free one and
    /// return (start, slot, wait_min). The caller writes the real departure
    /// back so the slot stays busy for the full recorded window.
    fn allocate(&mut self, requested: DateTime<Utc>, pinned: Option<u32>) -> (DateTime<Utc>, usize, f64) {
        let slot = match pinned {
            Some(idx) if (idx as usize) < self.free_at.len() => idx as usize,
            _ => self
                .free_at
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| **t)
                .map(|(i, _)| i)
                .unwrap_or(0),
        };
        let start = requested.max(self.free_at[slot]);
        let wait_min = minutes_between(start, requested).max(0.0);
        (start, slot, wait_min)
    }

    fn occupy_until(&mut self, slot: usize, until: DateTime<Utc>) {
        if slot < self.free_at.len() {
            self.free_at[slot] = until;
        }
    }
}

/// Replay all trains through the graph under safety enforcement.
pub fn replay(
    events: &[TrainEvent],
    graph: &SectionGraph,
    overrides: &ReplayOverrides,
) -> CoreResult<SimResult> {
    let mut by_train: BTreeMap<&str, Vec<&TrainEvent>> = BTreeMap::new();
    for event in events {
        by_train.entry(&event.train_id).or_default().push(event);
    }
    for group in by_train.values_mut() {
        sort_stops(group);
    }

    // Trains run in ascending order of their earliest known initial time.
    let mut train_order: Vec<(&str, Option<DateTime<Utc>>)> = by_train
        .iter()
        .map(|(tid, group)| {
            let t0 = group.iter().filter_map(|e| e.reference_time()).min();
            (*tid, t0)
        })
        .collect();
    train_order.sort_by(|a, b| {
        a.1.unwrap_or(DateTime::<Utc>::MAX_UTC)
            .cmp(&b.1.unwrap_or(DateTime::<Utc>::MAX_UTC))
            .then_with(|| a.0.cmp(b.0))
    });

    // Block allocators: a min-heap of next-available instants, one per track.
    let mut block_heaps: HashMap<&str, BinaryHeap<Reverse<DateTime<Utc>>>> = HashMap::new();
    for edge in graph.edges() {
        let mut heap = BinaryHeap::with_capacity(edge.capacity.max(1) as usize);
        for _ in 0..edge.capacity.max(1) {
            heap.push(Reverse(DateTime::<Utc>::MIN_UTC));
        }
        block_heaps.insert(edge.block_id.as_str(), heap);
    }
    let mut platforms: HashMap<String, PlatformSlots> = HashMap::new();

    let mut block_records: Vec<BlockOccupancy> = Vec::new();
    let mut platform_records: Vec<PlatformOccupancy> = Vec::new();
    let mut waits: Vec<WaitEntry> = Vec::new();

    for (train_id, _) in &train_order {
        let group = &by_train[train_id];
        let hops = itinerary(group, graph);
        if hops.is_empty() {
            continue;
        }
        let stops = stop_times(group);
        if let Err(reason) = replay_train(
            train_id,
            &hops,
            &stops,
            graph,
            overrides,
            &mut block_heaps,
            &mut platforms,
            &mut block_records,
            &mut platform_records,
            &mut waits,
        ) {
            warn!(train = %train_id, %reason, "skipping train during replay");
        }
    }

    // Allocator output must withstand an independent re-check; anything
    // slipping through here is a fatal enforcement bug, not an input defect.
    let (overlaps, headway_violations) = block_window_violations(&block_records, graph);
    if overlaps > 0 || headway_violations > 0 {
        return Err(CoreError::SafetyInvariantBroken(format!(
            "{overlaps} overlap(s), {headway_violations} headway violation(s) after enforcement"
        )));
    }
    let platform_overlaps = platform_window_violations(&platform_records);
    if platform_overlaps > 0 {
        return Err(CoreError::SafetyInvariantBroken(format!(
            "{platform_overlaps} platform slot overlap(s) after enforcement"
        )));
    }

    let sim_kpis = compute_kpis(events, &block_records, &platform_records, &waits);
    Ok(SimResult {
        block_occupancy: block_records,
        platform_occupancy: platform_records,
        waiting_ledger: waits,
        sim_kpis,
    })
}

/// Stops sort by stop_seq, then earliest time, then station id.
fn sort_stops(group: &mut [&TrainEvent]) {
    group.sort_by(|a, b| {
        a.stop_seq
            .unwrap_or(u32::MAX)
            .cmp(&b.stop_seq.unwrap_or(u32::MAX))
            .then_with(|| {
                a.earliest_time()
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
                    .cmp(&b.earliest_time().unwrap_or(DateTime::<Utc>::MAX_UTC))
            })
            .then_with(|| a.station_id.cmp(&b.station_id))
    });
}

/// Consecutive station pairs that exist as directed blocks in the graph.
fn itinerary(group: &[&TrainEvent], graph: &SectionGraph) -> Vec<(String, String, String)> {
    let mut hops = Vec::new();
    for pair in group.windows(2) {
        let (u, v) = (&pair[0].station_id, &pair[1].station_id);
        if let Some(block_id) = graph.block_for_pair(u, v) {
            hops.push((u.clone(), v.clone(), block_id.to_string()));
        }
    }
    hops
}

/// First-seen schedule/actual per station for scalar lookups.
fn stop_times(group: &[&TrainEvent]) -> HashMap<String, StopTimes> {
    let mut map: HashMap<String, StopTimes> = HashMap::new();
    for event in group {
        map.entry(event.station_id.clone()).or_insert(StopTimes {
            sched_arr: event.sched_arr,
            sched_dep: event.sched_dep,
            act_arr: event.act_arr,
            act_dep: event.act_dep,
        });
    }
    map
}

#[allow(clippy::too_many_arguments)]
fn replay_train(
    train_id: &str,
    hops: &[(String, String, String)],
    stops: &HashMap<String, StopTimes>,
    graph: &SectionGraph,
    overrides: &ReplayOverrides,
    block_heaps: &mut HashMap<&str, BinaryHeap<Reverse<DateTime<Utc>>>>,
    platforms: &mut HashMap<String, PlatformSlots>,
    block_records: &mut Vec<BlockOccupancy>,
    platform_records: &mut Vec<PlatformOccupancy>,
    waits: &mut Vec<WaitEntry>,
) -> Result<(), String> {
    let origin = &hops[0].0;
    let origin_attr = graph.station(origin);
    let origin_times = stops.get(origin).ok_or("origin stop missing")?;

    let arr_known = origin_times.act_arr.or(origin_times.sched_arr);
    let dep_known = origin_times.act_dep.or(origin_times.sched_dep);
    let (arr0, dep0) = match (arr_known, dep_known) {
        (None, None) => return Err("no usable time at origin".to_string()),
        (None, Some(dep)) => (dep - minutes(origin_attr.min_dwell_min), dep),
        (Some(arr), None) => (arr, arr + minutes(origin_attr.min_dwell_min)),
        (Some(arr), Some(dep)) => (arr, dep),
    };

    let slots = platforms
        .entry(origin.clone())
        .or_insert_with(|| PlatformSlots::new(origin_attr.platforms));
    let pinned = overrides
        .platform_override
        .get(&(train_id.to_string(), origin.clone()))
        .copied();
    let (start_plat, slot, wait_plat) = slots.allocate(arr0, pinned);
    let dwell_end = start_plat + minutes(origin_attr.min_dwell_min);
    let dep_origin = dep0.max(dwell_end);
    slots.occupy_until(slot, dep_origin);
    if wait_plat > 0.0 {
        waits.push(WaitEntry {
            train_id: train_id.to_string(),
            resource: WaitResource::Platform,
            id: origin.clone(),
            start_time: arr0,
            end_time: start_plat,
            minutes: wait_plat,
            reason: WaitReason::PlatformBusy,
        });
    }
    platform_records.push(PlatformOccupancy {
        train_id: train_id.to_string(),
        station_id: origin.clone(),
        arr_platform: start_plat,
        dep_platform: dep_origin,
        platform_slot: slot as u32,
    });

    let mut current_time = dep_origin;
    for (u, v, block_id) in hops {
        let Some(attr) = graph.block(block_id) else {
            debug!(train = %train_id, block = %block_id, "hop on unknown block, skipping");
            continue;
        };
        let times_u = stops.get(u);
        let times_v = stops.get(v);
        let act_dep_u = times_u.and_then(|t| t.act_dep);
        let act_arr_v = times_v.and_then(|t| t.act_arr);

        let observed_run = match (act_dep_u, act_arr_v) {
            (Some(dep), Some(arr)) => Some(minutes_between(arr, dep).max(0.0)),
            _ => None,
        };
        let mut run_min = observed_run.unwrap_or(attr.min_run_time);
        if let Some(factor) = overrides
            .per_train_speed
            .get(&(train_id.to_string(), block_id.clone()))
        {
            run_min *= factor.clamp(0.8, 1.0);
        }

        let heap = block_heaps
            .get_mut(block_id.as_str())
            .ok_or("allocator missing for block")?;
        let Reverse(available) = heap.pop().ok_or("empty block heap")?;
        let entry = current_time.max(available);
        let wait_block = minutes_between(entry, current_time).max(0.0);
        let exit = entry + minutes(run_min);
        let headway = graph.effective_headway(block_id, entry);
        heap.push(Reverse(exit + minutes(headway)));
        if wait_block > 0.0 {
            waits.push(WaitEntry {
                train_id: train_id.to_string(),
                resource: WaitResource::Block,
                id: block_id.clone(),
                start_time: current_time,
                end_time: entry,
                minutes: wait_block,
                reason: WaitReason::BlockOrHeadway,
            });
        }
        block_records.push(BlockOccupancy {
            train_id: train_id.to_string(),
            block_id: block_id.clone(),
            u: u.clone(),
            v: v.clone(),
            entry_time: entry,
            exit_time: exit,
            headway_applied_min: wait_block,
            source: occupancy_source(act_dep_u.is_some(), act_arr_v.is_some(), times_u, times_v),
        });

        // Never arrive earlier than reality.
        let mut arrival_v = exit;
        if let Some(actual) = act_arr_v {
            if arrival_v < actual {
                arrival_v = actual;
            }
        }

        let station_attr = graph.station(v);
        let slots = platforms
            .entry(v.clone())
            .or_insert_with(|| PlatformSlots::new(station_attr.platforms));
        let pinned = overrides
            .platform_override
            .get(&(train_id.to_string(), v.clone()))
            .copied();
        let platform_request = arrival_v + minutes(station_attr.route_setup_min);
        let (start_plat, slot, wait_plat) = slots.allocate(platform_request, pinned);
        let dwell_end = start_plat + minutes(station_attr.min_dwell_min);
        let dep_sched_v = times_v.and_then(|t| t.act_dep.or(t.sched_dep));
        let next_dep = match dep_sched_v {
            Some(dep) => dwell_end.max(dep),
            None => dwell_end,
        };
        slots.occupy_until(slot, next_dep);
        if wait_plat > 0.0 {
            waits.push(WaitEntry {
                train_id: train_id.to_string(),
                resource: WaitResource::Platform,
                id: v.clone(),
                start_time: arrival_v,
                end_time: start_plat,
                minutes: wait_plat,
                reason: WaitReason::PlatformBusyOrRoute,
            });
        }
        platform_records.push(PlatformOccupancy {
            train_id: train_id.to_string(),
            station_id: v.clone(),
            arr_platform: start_plat,
            dep_platform: next_dep,
            platform_slot: slot as u32,
        });

        current_time = next_dep;
    }
    Ok(())
}

fn occupancy_source(
    dep_actual: bool,
    arr_actual: bool,
    times_u: Option<&StopTimes>,
    times_v: Option<&StopTimes>,
) -> OccupancySource {
    match (dep_actual, arr_actual) {
        (true, true) => OccupancySource::Actual,
        (true, false) | (false, true) => OccupancySource::Hybrid,
        (false, false) => {
            let any_schedule = times_u.map(|t| t.sched_dep.is_some()).unwrap_or(false)
                || times_v.map(|t| t.sched_arr.is_some()).unwrap_or(false);
            if any_schedule {
                OccupancySource::Scheduled
            } else {
                OccupancySource::Inferred
            }
        }
    }
}

/// Count capacity overlaps and headway violations in enforced block windows.
///
/// Windows are assigned greedily to track slots: a slot can take a window
/// when its previous exit plus headway is no later than the new entry. A
/// window that fits no slot while all are busy is an overlap; one that only
/// fits inside another's headway shadow is a headway violation.
pub fn block_window_violations(occupancy: &[BlockOccupancy], graph: &SectionGraph) -> (u32, u32) {
    let mut by_block: BTreeMap<&str, Vec<&BlockOccupancy>> = BTreeMap::new();
    for window in occupancy {
        by_block.entry(&window.block_id).or_default().push(window);
    }

    let mut overlaps = 0u32;
    let mut headway_violations = 0u32;
    for (block_id, mut windows) in by_block {
        windows.sort_by_key(|w| (w.entry_time, w.exit_time));
        let capacity = graph.block_capacity(block_id).max(1) as usize;
        let headway = graph.block_headway(block_id);
        // per-slot (exit, exit + headway) tails
        let mut slots: Vec<(DateTime<Utc>, DateTime<Utc>)> =
            vec![(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MIN_UTC); capacity];
        for window in windows {
            // best fit: latest tail that still satisfies headway
            let fit = slots
                .iter()
                .enumerate()
                .filter(|(_, (_, ready))| *ready <= window.entry_time)
                .max_by_key(|(_, (exit, _))| *exit)
                .map(|(i, _)| i);
            match fit {
                Some(slot) => {
                    slots[slot] = (window.exit_time, window.exit_time + minutes(headway));
                }
                None => {
                    // distinguish hard overlap from a headway-shadow breach
                    let open = slots
                        .iter()
                        .enumerate()
                        .filter(|(_, (exit, _))| *exit <= window.entry_time)
                        .max_by_key(|(_, (exit, _))| *exit)
                        .map(|(i, _)| i);
                    match open {
                        Some(slot) => {
                            headway_violations += 1;
                            slots[slot] = (window.exit_time, window.exit_time + minutes(headway));
                        }
                        None => {
                            overlaps += 1;
                            // take the earliest-freeing slot to keep scanning
                            let slot = slots
                                .iter()
                                .enumerate()
                                .min_by_key(|(_, (exit, _))| *exit)
                                .map(|(i, _)| i)
                                .unwrap_or(0);
                            slots[slot] = (window.exit_time, window.exit_time + minutes(headway));
                        }
                    }
                }
            }
        }
    }
    (overlaps, headway_violations)
}

/// Platform windows on the same (station, slot) must be pairwise disjoint.
pub fn platform_window_violations(occupancy: &[PlatformOccupancy]) -> u32 {
    let mut by_slot: BTreeMap<(&str, u32), Vec<&PlatformOccupancy>> = BTreeMap::new();
    for window in occupancy {
        by_slot
            .entry((&window.station_id, window.platform_slot))
            .or_default()
            .push(window);
    }
    let mut violations = 0u32;
    for (_, mut windows) in by_slot {
        windows.sort_by_key(|w| (w.arr_platform, w.dep_platform));
        for pair in windows.windows(2) {
            if pair[1].arr_platform < pair[0].dep_platform {
                violations += 1;
            }
        }
    }
    violations
}

fn compute_kpis(
    events: &[TrainEvent],
    block_records: &[BlockOccupancy],
    platform_records: &[PlatformOccupancy],
    waits: &[WaitEntry],
) -> SimKpis {
    let mut kpis = SimKpis {
        trains_served: {
            let mut trains: Vec<&str> = block_records.iter().map(|b| b.train_id.as_str()).collect();
            trains.sort();
            trains.dedup();
            trains.len() as u32
        },
        ..Default::default()
    };

    // Delay at the final stop: last platform departure vs scheduled arrival.
    let mut sched_arr: HashMap<(&str, &str), DateTime<Utc>> = HashMap::new();
    for event in events {
        if let Some(arr) = event.sched_arr {
            sched_arr
                .entry((event.train_id.as_str(), event.station_id.as_str()))
                .or_insert(arr);
        }
    }
    let mut last_dep: BTreeMap<&str, &PlatformOccupancy> = BTreeMap::new();
    for window in platform_records {
        last_dep
            .entry(&window.train_id)
            .and_modify(|w| {
                if window.dep_platform > w.dep_platform {
                    *w = window;
                }
            })
            .or_insert(window);
    }
    let mut delays: Vec<f64> = Vec::new();
    for (train_id, window) in &last_dep {
        if let Some(sched) = sched_arr.get(&(*train_id, window.station_id.as_str())) {
            delays.push(minutes_between(window.dep_platform, *sched));
        }
    }
    if !delays.is_empty() {
        let on_time = delays.iter().filter(|d| d.abs() <= 5.0).count();
        kpis.otp_exit_pct = on_time as f64 / delays.len() as f64 * 100.0;
        kpis.avg_exit_delay_min = delays.iter().sum::<f64>() / delays.len() as f64;
        kpis.p90_exit_delay_min = quantile(&mut delays, 0.9);
    }

    for wait in waits {
        kpis.total_wait_min += wait.minutes;
        *kpis
            .wait_min_by_reason
            .entry(wait.reason.as_str().to_string())
            .or_insert(0.0) += wait.minutes;
    }
    kpis
}

/// Linear-interpolated quantile over an unsorted sample.
fn quantile(values: &mut [f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pos = q * (values.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        values[lower]
    } else {
        let frac = pos - lower as f64;
        values[lower] * (1.0 - frac) + values[upper] * frac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_interpolation() {
        let mut values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((quantile(&mut values, 0.9) - 4.6).abs() < 1e-9);
        let mut single = vec![7.0];
        assert_eq!(quantile(&mut single, 0.9), 7.0);
    }

    #[test]
    fn test_minutes_roundtrip() {
        let base: DateTime<Utc> = "2024-01-01T08:00:00Z".parse().unwrap();
        let shifted = base + minutes(2.5);
        assert!((minutes_between(shifted, base) - 2.5).abs() < 1e-9);
    }
}
