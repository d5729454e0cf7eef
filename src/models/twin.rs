use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the timing of an occupancy window came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OccupancySource {
    /// Both endpoints observed.
    Actual,
    /// Timetable only.
    Scheduled,
    /// One endpoint observed, the other projected.
    Hybrid,
    /// Neither observed nor scheduled; carried forward from upstream.
    Inferred,
}

/// One train's enforced window on a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockOccupancy {
    pub train_id: String,
    pub block_id: String,
    pub u: String,
    pub v: String,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    /// Minutes the entry was pushed back by block capacity or headway.
    pub headway_applied_min: f64,
    pub source: OccupancySource,
}

/// One train's dwell window on a platform slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformOccupancy {
    pub train_id: String,
    pub station_id: String,
    pub arr_platform: DateTime<Utc>,
    pub dep_platform: DateTime<Utc>,
    pub platform_slot: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitResource {
    Block,
    Platform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    BlockOrHeadway,
    PlatformBusy,
    PlatformBusyOrRoute,
}

impl WaitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitReason::BlockOrHeadway => "block_or_headway",
            WaitReason::PlatformBusy => "platform_busy",
            WaitReason::PlatformBusyOrRoute => "platform_busy_or_route",
        }
    }
}

/// Ledger entry explaining a deviation introduced by safety enforcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitEntry {
    pub train_id: String,
    pub resource: WaitResource,
    /// block_id or station_id depending on `resource`.
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub minutes: f64,
    pub reason: WaitReason,
}

/// Replay-level KPIs at the last stop of each train.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimKpis {
    pub trains_served: u32,
    pub otp_exit_pct: f64,
    pub avg_exit_delay_min: f64,
    pub p90_exit_delay_min: f64,
    pub total_wait_min: f64,
    pub wait_min_by_reason: BTreeMap<String, f64>,
}

impl Default for SimKpis {
    fn default() -> Self {
        Self {
            trains_served: 0,
            otp_exit_pct: 0.0,
            avg_exit_delay_min: 0.0,
            p90_exit_delay_min: 0.0,
            total_wait_min: 0.0,
            wait_min_by_reason: BTreeMap::new(),
        }
    }
}

/// Full output of one replay run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimResult {
    pub block_occupancy: Vec<BlockOccupancy>,
    pub platform_occupancy: Vec<PlatformOccupancy>,
    pub waiting_ledger: Vec<WaitEntry>,
    pub sim_kpis: SimKpis,
}

/// Per-train virtual position derived from block occupancy at a given time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainPosition {
    pub train_id: String,
    pub block_id: String,
    pub u: String,
    pub v: String,
    /// Fraction of the current block already covered, in [0, 1].
    pub progress_pct: f64,
    pub eta_next: DateTime<Utc>,
}
