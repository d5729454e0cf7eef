//! Flat row shapes for parquet artifacts.
//!
//! Timestamps are RFC 3339 UTC strings in the files; conversions to and
//! from the in-memory model live here so the rest of the crate never sees
//! stringly-typed time.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::models::{
    BlockOccupancy, OccupancySource, PlatformOccupancy, TimelineBucket, TrainClass, TrainEvent,
    WaitEntry, WaitReason, WaitResource,
};

fn fmt(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn fmt_opt(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(fmt)
}

fn parse_ts(raw: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CoreError::InputDefect(format!("bad timestamp '{raw}': {e}")))
}

fn parse_ts_opt(raw: &Option<String>) -> CoreResult<Option<DateTime<Utc>>> {
    match raw {
        Some(text) => parse_ts(text).map(Some),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub train_id: String,
    pub station_id: String,
    pub service_date: String,
    pub stop_seq: Option<i64>,
    pub sched_arr: Option<String>,
    pub sched_dep: Option<String>,
    pub act_arr: Option<String>,
    pub act_dep: Option<String>,
    pub priority: i64,
    pub class: String,
}

impl From<&TrainEvent> for EventRow {
    fn from(event: &TrainEvent) -> Self {
        Self {
            train_id: event.train_id.clone(),
            station_id: event.station_id.clone(),
            service_date: event.service_date.format("%Y-%m-%d").to_string(),
            stop_seq: event.stop_seq.map(|s| s as i64),
            sched_arr: fmt_opt(event.sched_arr),
            sched_dep: fmt_opt(event.sched_dep),
            act_arr: fmt_opt(event.act_arr),
            act_dep: fmt_opt(event.act_dep),
            priority: event.priority as i64,
            class: event.class.as_str().to_string(),
        }
    }
}

impl EventRow {
    pub fn into_event(self) -> CoreResult<TrainEvent> {
        Ok(TrainEvent {
            sched_arr: parse_ts_opt(&self.sched_arr)?,
            sched_dep: parse_ts_opt(&self.sched_dep)?,
            act_arr: parse_ts_opt(&self.act_arr)?,
            act_dep: parse_ts_opt(&self.act_dep)?,
            service_date: NaiveDate::parse_from_str(&self.service_date, "%Y-%m-%d")
                .map_err(|e| CoreError::InputDefect(format!("bad service_date: {e}")))?,
            stop_seq: self.stop_seq.and_then(|s| u32::try_from(s).ok()),
            priority: self.priority.max(0) as u32,
            class: TrainClass::from_name(&self.class),
            train_id: self.train_id,
            station_id: self.station_id,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockOccupancyRow {
    pub train_id: String,
    pub block_id: String,
    pub u: String,
    pub v: String,
    pub entry_time: String,
    pub exit_time: String,
    pub headway_applied_min: f64,
    pub source: String,
}

impl From<&BlockOccupancy> for BlockOccupancyRow {
    fn from(occ: &BlockOccupancy) -> Self {
        let source = match occ.source {
            OccupancySource::Actual => "actual",
            OccupancySource::Scheduled => "scheduled",
            OccupancySource::Hybrid => "hybrid",
            OccupancySource::Inferred => "inferred",
        };
        Self {
            train_id: occ.train_id.clone(),
            block_id: occ.block_id.clone(),
            u: occ.u.clone(),
            v: occ.v.clone(),
            entry_time: fmt(occ.entry_time),
            exit_time: fmt(occ.exit_time),
            headway_applied_min: occ.headway_applied_min,
            source: source.to_string(),
        }
    }
}

impl BlockOccupancyRow {
    pub fn into_model(self) -> CoreResult<BlockOccupancy> {
        let source = match self.source.as_str() {
            "actual" => OccupancySource::Actual,
            "hybrid" => OccupancySource::Hybrid,
            "inferred" => OccupancySource::Inferred,
            _ => OccupancySource::Scheduled,
        };
        Ok(BlockOccupancy {
            entry_time: parse_ts(&self.entry_time)?,
            exit_time: parse_ts(&self.exit_time)?,
            headway_applied_min: self.headway_applied_min,
            source,
            train_id: self.train_id,
            block_id: self.block_id,
            u: self.u,
            v: self.v,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformOccupancyRow {
    pub train_id: String,
    pub station_id: String,
    pub arr_platform: String,
    pub dep_platform: String,
    pub platform_slot: i64,
}

impl From<&PlatformOccupancy> for PlatformOccupancyRow {
    fn from(occ: &PlatformOccupancy) -> Self {
        Self {
            train_id: occ.train_id.clone(),
            station_id: occ.station_id.clone(),
            arr_platform: fmt(occ.arr_platform),
            dep_platform: fmt(occ.dep_platform),
            platform_slot: occ.platform_slot as i64,
        }
    }
}

impl PlatformOccupancyRow {
    pub fn into_model(self) -> CoreResult<PlatformOccupancy> {
        Ok(PlatformOccupancy {
            arr_platform: parse_ts(&self.arr_platform)?,
            dep_platform: parse_ts(&self.dep_platform)?,
            platform_slot: self.platform_slot.max(0) as u32,
            train_id: self.train_id,
            station_id: self.station_id,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitRow {
    pub train_id: String,
    pub resource: String,
    pub id: String,
    pub start_time: String,
    pub end_time: String,
    pub minutes: f64,
    pub reason: String,
}

impl From<&WaitEntry> for WaitRow {
    fn from(wait: &WaitEntry) -> Self {
        Self {
            train_id: wait.train_id.clone(),
            resource: match wait.resource {
                WaitResource::Block => "block".to_string(),
                WaitResource::Platform => "platform".to_string(),
            },
            id: wait.id.clone(),
            start_time: fmt(wait.start_time),
            end_time: fmt(wait.end_time),
            minutes: wait.minutes,
            reason: wait.reason.as_str().to_string(),
        }
    }
}

impl WaitRow {
    pub fn into_model(self) -> CoreResult<WaitEntry> {
        let resource = match self.resource.as_str() {
            "block" => WaitResource::Block,
            _ => WaitResource::Platform,
        };
        let reason = match self.reason.as_str() {
            "block_or_headway" => WaitReason::BlockOrHeadway,
            "platform_busy" => WaitReason::PlatformBusy,
            _ => WaitReason::PlatformBusyOrRoute,
        };
        Ok(WaitEntry {
            start_time: parse_ts(&self.start_time)?,
            end_time: parse_ts(&self.end_time)?,
            minutes: self.minutes,
            resource,
            reason,
            train_id: self.train_id,
            id: self.id,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineRow {
    pub ts_bucket: String,
    pub resource_type: String,
    pub resource_id: String,
    pub risk_count: i64,
}

impl From<&TimelineBucket> for TimelineRow {
    fn from(bucket: &TimelineBucket) -> Self {
        Self {
            ts_bucket: fmt(bucket.ts_bucket),
            resource_type: bucket.resource_type.clone(),
            resource_id: bucket.resource_id.clone(),
            risk_count: bucket.risk_count as i64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrainClass;

    #[test]
    fn test_event_row_roundtrip() {
        let event = TrainEvent {
            train_id: "T1".to_string(),
            station_id: "S1".to_string(),
            service_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            stop_seq: Some(3),
            sched_arr: Some("2024-01-01T08:00:00Z".parse().unwrap()),
            sched_dep: Some("2024-01-01T08:05:00Z".parse().unwrap()),
            act_arr: None,
            act_dep: None,
            priority: 2,
            class: TrainClass::Express,
        };
        let row = EventRow::from(&event);
        let back = row.into_event().unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_block_row_roundtrip() {
        let occ = BlockOccupancy {
            train_id: "T1".to_string(),
            block_id: "B1".to_string(),
            u: "S1".to_string(),
            v: "S2".to_string(),
            entry_time: "2024-01-01T08:00:00Z".parse().unwrap(),
            exit_time: "2024-01-01T08:10:00Z".parse().unwrap(),
            headway_applied_min: 1.5,
            source: OccupancySource::Hybrid,
        };
        let back = BlockOccupancyRow::from(&occ).into_model().unwrap();
        assert_eq!(back, occ);
    }
}
