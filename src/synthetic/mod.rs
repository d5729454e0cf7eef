//! Synthetic corridor and timetable generation for demos and tests.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::{seq::SliceRandom, Rng};

use crate::models::{BlockRecord, StationRecord, TrainClass, TrainEvent};

#[derive(Debug, Clone)]
pub struct CorridorConfig {
    pub stations: usize,
    pub trains: usize,
    pub service_date: chrono::NaiveDate,
    /// First departure of the day, minutes after midnight UTC.
    pub first_departure_min: i64,
    /// Gap between successive train departures, minutes.
    pub launch_interval_min: i64,
}

impl Default for CorridorConfig {
    fn default() -> Self {
        Self {
            stations: 6,
            trains: 10,
            service_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap_or_else(|| Utc::now().date_naive()),
            first_departure_min: 8 * 60,
            launch_interval_min: 7,
        }
    }
}

/// Generator for a single linear corridor with both-direction blocks.
#[derive(Debug, Default)]
pub struct CorridorGenerator;

impl CorridorGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate_stations(&self, count: usize) -> Vec<StationRecord> {
        let mut rng = rand::thread_rng();
        (0..count.max(2))
            .map(|i| StationRecord {
                station_id: format!("S{:04}", i + 1),
                name: Some(format!("Station {}", i + 1)),
                platforms: rng.gen_range(1..=3),
                min_dwell_min: 2.0,
                route_setup_min: 0.5,
                lat: Some(12.9 + i as f64 * 0.08),
                lon: Some(77.5 + i as f64 * 0.11),
            })
            .collect()
    }

    pub fn generate_blocks(&self, stations: &[StationRecord]) -> Vec<BlockRecord> {
        let mut rng = rand::thread_rng();
        let mut blocks = Vec::new();
        let mut next_id = 1u32;
        for pair in stations.windows(2) {
            let run = rng.gen_range(6.0..=14.0f64).round();
            let headway = rng.gen_range(3.0..=6.0f64).round();
            let capacity = if rng.gen_bool(0.2) { 2 } else { 1 };
            for (u, v) in [
                (&pair[0].station_id, &pair[1].station_id),
                (&pair[1].station_id, &pair[0].station_id),
            ] {
                blocks.push(BlockRecord {
                    block_id: format!("B{next_id:04}"),
                    u: u.clone(),
                    v: v.clone(),
                    min_run_time: run,
                    headway,
                    capacity,
                    headway_peak_p90: None,
                    headway_offpeak_p90: None,
                });
                next_id += 1;
            }
        }
        blocks
    }

    /// Generate a staggered down-direction timetable over the corridor.
    pub fn generate_timetable(
        &self,
        config: &CorridorConfig,
        stations: &[StationRecord],
        blocks: &[BlockRecord],
    ) -> Vec<TrainEvent> {
        let mut rng = rand::thread_rng();
        let names = [
            "Express", "Superfast", "Passenger", "EMU", "Freight", "Mail Express",
        ];
        let midnight = Utc.from_utc_datetime(
            &config
                .service_date
                .and_hms_opt(0, 0, 0)
                .unwrap_or_default(),
        );

        let run_of = |u: &str, v: &str| -> f64 {
            blocks
                .iter()
                .find(|b| b.u == u && b.v == v)
                .map(|b| b.min_run_time)
                .unwrap_or(10.0)
        };

        let mut events = Vec::new();
        for t in 0..config.trains {
            let train_id = format!("{}", 12000 + t as u32 * 7 + rng.gen_range(0..5));
            let name = names.choose(&mut rng).copied().unwrap_or("Passenger");
            let class = TrainClass::from_name(name);
            let priority = match class {
                TrainClass::Superfast => 4,
                TrainClass::Express => 3,
                TrainClass::Emu => 2,
                TrainClass::Passenger => 1,
                TrainClass::Freight => 0,
            };
            let mut clock: DateTime<Utc> = midnight
                + Duration::minutes(config.first_departure_min + t as i64 * config.launch_interval_min);
            for (seq, pair) in stations.windows(2).enumerate() {
                let u = &pair[0].station_id;
                let v = &pair[1].station_id;
                let is_first = seq == 0;
                let arr = if is_first { None } else { Some(clock) };
                let dep = clock + Duration::minutes(pair[0].min_dwell_min as i64);
                events.push(TrainEvent {
                    train_id: train_id.clone(),
                    station_id: u.clone(),
                    service_date: config.service_date,
                    stop_seq: Some(seq as u32 + 1),
                    sched_arr: arr,
                    sched_dep: Some(dep),
                    act_arr: None,
                    act_dep: None,
                    priority,
                    class,
                });
                clock = dep + Duration::minutes(run_of(u, v) as i64);
            }
            // terminal stop
            if let Some(last) = stations.last() {
                events.push(TrainEvent {
                    train_id: train_id.clone(),
                    station_id: last.station_id.clone(),
                    service_date: config.service_date,
                    stop_seq: Some(stations.len() as u32),
                    sched_arr: Some(clock),
                    sched_dep: None,
                    act_arr: None,
                    act_dep: None,
                    priority,
                    class,
                });
            }
        }
        events
    }

    /// Full demo bundle: stations, blocks, timetable.
    pub fn generate(
        &self,
        config: &CorridorConfig,
    ) -> (Vec<StationRecord>, Vec<BlockRecord>, Vec<TrainEvent>) {
        let stations = self.generate_stations(config.stations);
        let blocks = self.generate_blocks(&stations);
        let events = self.generate_timetable(config, &stations, &blocks);
        (stations, blocks, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::SectionGraph;
    use crate::twin::{replay, ReplayOverrides};

    #[test]
    fn test_generated_corridor_is_loadable_and_replayable() {
        let generator = CorridorGenerator::new();
        let config = CorridorConfig {
            stations: 4,
            trains: 5,
            ..Default::default()
        };
        let (stations, blocks, events) = generator.generate(&config);
        assert_eq!(blocks.len(), (stations.len() - 1) * 2);

        let graph = SectionGraph::load(stations, blocks).unwrap();
        let sim = replay(&events, &graph, &ReplayOverrides::default()).unwrap();
        assert_eq!(sim.sim_kpis.trains_served, 5);
        assert!(!sim.block_occupancy.is_empty());
    }
}
