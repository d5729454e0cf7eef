use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Train service class, derivable from the train name or number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainClass {
    Superfast,
    Express,
    Emu,
    Passenger,
    Freight,
}

impl TrainClass {
    /// Best-effort classification from a human-readable train name.
    pub fn from_name(name: &str) -> Self {
        let n = name.to_lowercase();
        if n.contains("superfast") || n.contains(" sf ") || n.ends_with(" sf") {
            TrainClass::Superfast
        } else if n.contains("emu") || n.contains("memu") || n.contains("local") {
            TrainClass::Emu
        } else if n.contains("freight") || n.contains("goods") {
            TrainClass::Freight
        } else if n.contains("express") || n.contains("exp") || n.contains("mail") {
            TrainClass::Express
        } else {
            TrainClass::Passenger
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrainClass::Superfast => "Superfast",
            TrainClass::Express => "Express",
            TrainClass::Emu => "EMU",
            TrainClass::Passenger => "Passenger",
            TrainClass::Freight => "Freight",
        }
    }
}

/// One canonical train-at-station record.
///
/// Unique by (train_id, station_id, service_date, stop_seq). All timestamps
/// are absolute UTC instants; the normaliser has already applied midnight
/// rollover and placeholder removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainEvent {
    pub train_id: String,
    pub station_id: String,
    pub service_date: NaiveDate,
    pub stop_seq: Option<u32>,
    pub sched_arr: Option<DateTime<Utc>>,
    pub sched_dep: Option<DateTime<Utc>>,
    pub act_arr: Option<DateTime<Utc>>,
    pub act_dep: Option<DateTime<Utc>>,
    pub priority: u32,
    pub class: TrainClass,
}

impl TrainEvent {
    /// Earliest known instant for this stop across all four time fields.
    pub fn earliest_time(&self) -> Option<DateTime<Utc>> {
        [self.act_dep, self.sched_dep, self.act_arr, self.sched_arr]
            .into_iter()
            .flatten()
            .min()
    }

    /// Best available reference time for ordering within an itinerary,
    /// preferring departures over arrivals and actuals over schedule.
    pub fn reference_time(&self) -> Option<DateTime<Utc>> {
        self.act_dep
            .or(self.sched_dep)
            .or(self.act_arr)
            .or(self.sched_arr)
    }
}

/// Normalised event set with a schema version stamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvents {
    pub schema_version: u32,
    pub service_date: NaiveDate,
    pub events: Vec<TrainEvent>,
}

/// Ingestion wire shape emitted by adapters and merged by the engine sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub source: String,
    /// Stable dedupe key, e.g. `train_id:station_id:event_type:ts`.
    pub event_key: String,
    pub ts: DateTime<Utc>,
    pub train_id: String,
    /// 'arr', 'dep', 'eta', 'hold', 'policy', ...
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(default)]
    pub fields: HashMap<String, serde_json::Value>,
}
